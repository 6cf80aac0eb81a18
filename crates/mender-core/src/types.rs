//! Core type definitions for Mender

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::trace::{format_frames, FrameFilter, StackFrame};
use crate::{MenderError, Result};

/// Opaque identifier of a captured fault
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Random id, falling back to a timestamp-derived id if the random
    /// source is unavailable.
    pub fn generate() -> Self {
        match std::panic::catch_unwind(Uuid::new_v4) {
            Ok(uuid) => Self(uuid.simple().to_string()),
            Err(_) => Self::fallback(),
        }
    }

    /// Deterministic id derived from the wall clock
    pub fn fallback() -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("fault_{}", nanos))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in branch names and logs
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a fault event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(&self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}

/// Best-effort location of the first caller-owned frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl SourceLocation {
    pub fn is_known(&self) -> bool {
        !self.file.is_empty() && self.line > 0
    }
}

/// A captured runtime fault
///
/// Identity, message, trace and location are fixed at construction; only the
/// status and its timestamps change afterwards, through the `mark_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    id: EventId,
    timestamp: DateTime<Utc>,
    message: String,
    stack_trace: String,
    location: SourceLocation,
    status: EventStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl FaultEvent {
    /// Build an event from a fault message and the frames of its call stack
    ///
    /// `location` overrides the frame-derived location when the exact fault
    /// site is known (e.g. from a panic hook).
    pub fn from_frames(
        message: impl Into<String>,
        frames: &[StackFrame],
        filter: &FrameFilter,
        location: Option<SourceLocation>,
    ) -> Self {
        let location = location.unwrap_or_else(|| {
            filter
                .first_caller_frame(frames)
                .map(|frame| SourceLocation {
                    file: frame.file.clone().unwrap_or_default(),
                    line: frame.line.unwrap_or_default(),
                    function: frame.function.clone(),
                })
                .unwrap_or_default()
        });

        Self {
            id: EventId::generate(),
            timestamp: Utc::now(),
            message: message.into(),
            stack_trace: format_frames(frames),
            location,
            status: EventStatus::Queued,
            started_at: None,
            completed_at: None,
        }
    }

    /// Event with an explicit id and no trace, mostly for tests and replays
    pub fn with_id(id: impl Into<EventId>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            stack_trace: String::new(),
            location: SourceLocation::default(),
            status: EventStatus::Queued,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(EventStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(EventStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self) -> Result<()> {
        self.transition(EventStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: EventStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MenderError::InvalidTransition {
                event_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "Fault at {}:{} in {}: {}",
            self.location.file, self.location.line, self.location.function, self.message
        )
    }

    /// Multi-line description handed to the analysis collaborator
    pub fn context(&self) -> String {
        let mut context = String::new();
        context.push_str(&format!("Error: {}\n", self.message));
        context.push_str(&format!(
            "Location: {}:{}\n",
            self.location.file, self.location.line
        ));
        context.push_str(&format!("Function: {}\n", self.location.function));
        context.push_str(&format!("Timestamp: {}\n", self.timestamp.to_rfc3339()));
        context.push_str("Stack Trace:\n");
        context.push_str(&self.stack_trace);
        context
    }

    /// Short description of where the fault happened, empty when unknown
    pub fn source_context(&self) -> String {
        if !self.location.is_known() {
            return String::new();
        }
        format!(
            "// Error occurred in file: {} at line {} in function: {}",
            self.location.file, self.location.line, self.location.function
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Request handed to the analysis collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixRequest {
    pub fault_message: String,
    pub stack_trace: String,
    pub source_context: String,
    /// Free-text description of the fault
    pub context: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Extra context gathered by an enrichment side-call, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<String>,
}

impl FixRequest {
    pub fn from_event(event: &FaultEvent) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("event_id".to_string(), event.id().to_string());
        if event.location().is_known() {
            metadata.insert("source_file".to_string(), event.location().file.clone());
            metadata.insert("line".to_string(), event.location().line.to_string());
            metadata.insert("function".to_string(), event.location().function.clone());
        }

        Self {
            fault_message: event.message().to_string(),
            stack_trace: event.stack_trace().to_string(),
            source_context: event.source_context(),
            context: event.context(),
            metadata,
            enrichment: None,
        }
    }
}

/// Proposed fix returned by the analysis collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    pub proposed_fix: String,
    pub explanation: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub is_valid: bool,
    /// Which provider produced this proposal
    #[serde(default)]
    pub provider: String,
}

impl FixProposal {
    /// Whether the proposal clears the bar for opening a pull request
    pub fn is_actionable(&self, confidence_threshold: f64) -> bool {
        self.is_valid
            && !self.proposed_fix.trim().is_empty()
            && self.confidence >= confidence_threshold
    }
}

/// A single file write in a pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// Request handed to the source-hosting collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSpec {
    /// `owner/name` to open the pull request against; the client's own default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Branch the fix is proposed into
    pub base_branch: String,
    pub branch_name: String,
    pub title: String,
    pub description: String,
    pub changes: Vec<FileChange>,
}

/// Terminal result of processing one fault event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub event_id: EventId,
    pub status: EventStatus,
    /// Title of the pull request opened for this event, if one was
    pub pull_request: Option<String>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        self.status == EventStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_generate_is_unique() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_event_id_fallback_prefix() {
        assert!(EventId::fallback().as_str().starts_with("fault_"));
    }

    #[test]
    fn test_status_transitions() {
        let mut event = FaultEvent::with_id("e1", "boom");
        assert_eq!(event.status(), EventStatus::Queued);
        assert!(event.mark_completed().is_err());

        event.mark_processing().unwrap();
        assert!(event.started_at().is_some());
        assert!(event.mark_processing().is_err());

        event.mark_completed().unwrap();
        assert_eq!(event.status(), EventStatus::Completed);
        assert!(event.completed_at().is_some());
        assert!(event.mark_failed().is_err());
    }

    #[test]
    fn test_from_frames_picks_first_caller_frame() {
        let frames = vec![
            StackFrame::new("std::panicking::begin_panic")
                .with_location("/rustc/x/panicking.rs", 1),
            StackFrame::new("my_app::run").with_location("src/main.rs", 12),
            StackFrame::new("main"),
        ];
        let event =
            FaultEvent::from_frames("index out of bounds", &frames, &FrameFilter::default(), None);

        assert_eq!(event.location().file, "src/main.rs");
        assert_eq!(event.location().line, 12);
        assert_eq!(event.location().function, "my_app::run");
        assert!(event.stack_trace().contains("src/main.rs:12 my_app::run"));
        assert_eq!(event.status(), EventStatus::Queued);
    }

    #[test]
    fn test_explicit_location_wins() {
        let frames = vec![StackFrame::new("my_app::run").with_location("src/main.rs", 12)];
        let location = SourceLocation {
            file: "src/lib.rs".to_string(),
            line: 7,
            function: "my_app::parse".to_string(),
        };
        let event =
            FaultEvent::from_frames("boom", &frames, &FrameFilter::default(), Some(location));
        assert_eq!(event.location().file, "src/lib.rs");
        assert_eq!(event.location().line, 7);
    }

    #[test]
    fn test_summary_and_context() {
        let event = FaultEvent::with_id("e1", "divide by zero").with_location(SourceLocation {
            file: "src/math.rs".to_string(),
            line: 42,
            function: "calc::div".to_string(),
        });
        assert_eq!(event.summary(), "Fault at src/math.rs:42 in calc::div: divide by zero");
        assert!(event.context().contains("Function: calc::div"));
        assert!(event.source_context().contains("src/math.rs at line 42"));
    }

    #[test]
    fn test_source_context_empty_when_unknown() {
        let event = FaultEvent::with_id("e1", "boom");
        assert!(event.source_context().is_empty());
    }

    #[test]
    fn test_fix_request_metadata() {
        let event = FaultEvent::with_id("e1", "boom").with_location(SourceLocation {
            file: "src/a.rs".to_string(),
            line: 3,
            function: "a::f".to_string(),
        });
        let request = FixRequest::from_event(&event);
        assert_eq!(request.fault_message, "boom");
        assert_eq!(request.metadata.get("source_file").map(String::as_str), Some("src/a.rs"));
        assert_eq!(request.metadata.get("event_id").map(String::as_str), Some("e1"));
    }

    #[test]
    fn test_proposal_actionable() {
        let mut proposal = FixProposal {
            proposed_fix: "fn f() {}".to_string(),
            explanation: String::new(),
            confidence: 0.7,
            is_valid: true,
            provider: "mock".to_string(),
        };
        assert!(proposal.is_actionable(0.7));

        proposal.confidence = 0.69;
        assert!(!proposal.is_actionable(0.7));

        proposal.confidence = 0.9;
        proposal.is_valid = false;
        assert!(!proposal.is_actionable(0.7));

        proposal.is_valid = true;
        proposal.proposed_fix = "  ".to_string();
        assert!(!proposal.is_actionable(0.7));
    }

    #[test]
    fn test_event_json_roundtrip_keeps_status() {
        let mut event = FaultEvent::with_id("e1", "boom");
        event.mark_processing().unwrap();
        let json = event.to_json().unwrap();
        assert!(json.contains("\"status\":\"processing\""));
        let back: FaultEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status(), EventStatus::Processing);
    }
}
