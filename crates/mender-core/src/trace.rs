//! Stack frame model and filtering
//!
//! Frames come from whatever trace source the host supplies. The filter decides
//! which frames belong to the runtime or to Mender itself so the first
//! caller-owned frame can be reported as the fault location.

use serde::{Deserialize, Serialize};

/// One frame of a captured call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Demangled function path, e.g. `my_app::handlers::upload`
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{} {}", file, line, self.function),
            (Some(file), None) => write!(f, "{} {}", file, self.function),
            _ => write!(f, "<unknown> {}", self.function),
        }
    }
}

/// Predicate separating internal frames from caller-owned frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFilter {
    internal_prefixes: Vec<String>,
}

impl FrameFilter {
    pub fn new(internal_prefixes: Vec<String>) -> Self {
        Self { internal_prefixes }
    }

    /// A frame is internal when its function path or file starts with (or,
    /// for files, contains) one of the configured prefixes.
    pub fn is_internal(&self, frame: &StackFrame) -> bool {
        let function = frame.function.trim_start_matches('<');
        self.internal_prefixes.iter().any(|prefix| {
            function.starts_with(prefix.as_str())
                || frame
                    .file
                    .as_deref()
                    .is_some_and(|file| file.contains(prefix.as_str()))
        })
    }

    /// First frame that is not internal
    pub fn first_caller_frame<'a>(&self, frames: &'a [StackFrame]) -> Option<&'a StackFrame> {
        frames.iter().find(|frame| !self.is_internal(frame))
    }
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new(default_internal_prefixes())
    }
}

/// Prefixes treated as runtime/library frames out of the box
pub fn default_internal_prefixes() -> Vec<String> {
    [
        "std::",
        "core::",
        "alloc::",
        "backtrace::",
        "rust_begin_unwind",
        "__rust",
        "tokio::",
        "futures_util::",
        "futures::",
        "mender_core::",
        "mender_orchestrator::",
        "/rustc/",
        ".cargo/registry/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Render frames one per line as `file:line function`
pub fn format_frames(frames: &[StackFrame]) -> String {
    frames
        .iter()
        .map(|frame| frame.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the text rendering of `std::backtrace::Backtrace`
///
/// The format is a numbered function line optionally followed by an
/// indented `at file:line:col` line. Unparseable lines are skipped.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                if frame.file.is_none() {
                    let (file, line_no) = split_location(location);
                    frame.file = Some(file);
                    frame.line = line_no;
                }
            }
            continue;
        }

        if let Some((index, function)) = line.split_once(": ") {
            if index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(StackFrame::new(strip_hash(function.trim())));
            }
        }
    }

    frames
}

/// `src/lib.rs:10:5` -> (`src/lib.rs`, Some(10))
fn split_location(location: &str) -> (String, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let rest = parts.next();

    match (rest, middle, last) {
        (Some(file), Some(line), Some(_col)) => match line.parse() {
            Ok(n) => (file.to_string(), Some(n)),
            Err(_) => (location.to_string(), None),
        },
        (None, Some(file), Some(line)) => match line.parse() {
            Ok(n) => (file.to_string(), Some(n)),
            Err(_) => (location.to_string(), None),
        },
        _ => (location.to_string(), None),
    }
}

/// Drop the trailing `::h0123abcd` disambiguator rustc appends to symbols
fn strip_hash(function: &str) -> String {
    match function.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            head.to_string()
        }
        _ => function.to_string(),
    }
}
