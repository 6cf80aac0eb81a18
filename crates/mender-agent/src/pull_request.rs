//! Pull request metadata for remediation
//!
//! Builds the branch name, title and description for a fix, and validates a
//! request before it is handed to the hosting client.

use mender_core::config::{RepositoryConfig, DEFAULT_BASE_BRANCH};
use mender_core::{FaultEvent, FileChange, FixProposal, MenderError, PullRequestSpec, Result};

const BRANCH_PREFIX: &str = "mender/fix-";
const MAX_SLUG_LEN: usize = 40;
const MAX_TITLE_MESSAGE_LEN: usize = 60;

/// Deterministic branch name: `mender/fix-<id8>-<function slug>`
pub fn branch_name(event: &FaultEvent) -> String {
    let function = &event.location().function;
    let short_name = function.rsplit("::").next().unwrap_or(function);
    let slug = slugify(short_name);

    if slug.is_empty() {
        format!("{}{}", BRANCH_PREFIX, event.id().short())
    } else {
        format!("{}{}-{}", BRANCH_PREFIX, event.id().short(), slug)
    }
}

pub fn title(event: &FaultEvent) -> String {
    let message = truncate(event.message().lines().next().unwrap_or(""), MAX_TITLE_MESSAGE_LEN);
    let function = &event.location().function;

    if function.is_empty() {
        format!("Fix: {}", message)
    } else {
        format!("Fix: {} in {}", message, function)
    }
}

/// Markdown body describing the fault and the proposed fix
pub fn description(event: &FaultEvent, proposal: &FixProposal) -> String {
    let mut body = String::new();

    body.push_str("## Automated fix for runtime fault\n\n");
    body.push_str(&format!("**Error:** `{}`\n\n", event.message()));
    if event.location().is_known() {
        body.push_str(&format!(
            "**Location:** `{}:{}` in `{}`\n\n",
            event.location().file,
            event.location().line,
            event.location().function
        ));
    }
    body.push_str(&format!("**Captured:** {}\n\n", event.timestamp().to_rfc3339()));
    body.push_str(&format!("**Event ID:** `{}`\n\n", event.id()));

    body.push_str("## Analysis\n\n");
    if proposal.explanation.trim().is_empty() {
        body.push_str("_No explanation provided._\n\n");
    } else {
        body.push_str(proposal.explanation.trim());
        body.push_str("\n\n");
    }
    body.push_str(&format!(
        "**Confidence:** {:.0}%",
        (proposal.confidence * 100.0).clamp(0.0, 100.0)
    ));
    if !proposal.provider.is_empty() {
        body.push_str(&format!(" (via {})", proposal.provider));
    }
    body.push_str("\n\n");

    if !event.stack_trace().is_empty() {
        body.push_str("<details>\n<summary>Stack trace</summary>\n\n```\n");
        body.push_str(event.stack_trace());
        body.push_str("\n```\n\n</details>\n\n");
    }

    body.push_str("---\nReview carefully before merging.\n");
    body
}

/// Build the pull request for `proposal`, writing the fix to the fault's source file
///
/// Without a `repository` the request targets the hosting client's default
/// repository and the `main` branch.
pub fn build(
    event: &FaultEvent,
    proposal: &FixProposal,
    repository: Option<&RepositoryConfig>,
) -> Result<PullRequestSpec> {
    let spec = PullRequestSpec {
        repository: repository.map(RepositoryConfig::full_name),
        base_branch: repository
            .map(|repo| repo.base_branch.clone())
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        branch_name: branch_name(event),
        title: title(event),
        description: description(event, proposal),
        changes: vec![FileChange {
            path: event.location().file.clone(),
            content: proposal.proposed_fix.clone(),
        }],
    };
    validate(&spec)?;
    Ok(spec)
}

/// Reject requests the hosting API could not act on
pub fn validate(spec: &PullRequestSpec) -> Result<()> {
    if spec.base_branch.trim().is_empty() {
        return Err(MenderError::InvalidPullRequest(
            "base branch is required".to_string(),
        ));
    }
    if spec.branch_name.trim().is_empty() {
        return Err(MenderError::InvalidPullRequest(
            "branch name is required".to_string(),
        ));
    }
    if spec.title.trim().is_empty() {
        return Err(MenderError::InvalidPullRequest("title is required".to_string()));
    }
    if spec.changes.is_empty() {
        return Err(MenderError::InvalidPullRequest(
            "at least one file change is required".to_string(),
        ));
    }
    for (i, change) in spec.changes.iter().enumerate() {
        if change.path.trim().is_empty() {
            return Err(MenderError::InvalidPullRequest(format!(
                "file change {} has an empty path",
                i
            )));
        }
        if change.content.is_empty() {
            return Err(MenderError::InvalidPullRequest(format!(
                "file change {} ({}) has empty content",
                i, change.path
            )));
        }
    }
    Ok(())
}

fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut last_dash = true;

    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    slug.trim_end_matches('-').to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::SourceLocation;

    fn event() -> FaultEvent {
        FaultEvent::with_id("0123456789abcdef", "attempt to divide by zero").with_location(
            SourceLocation {
                file: "src/billing.rs".to_string(),
                line: 88,
                function: "billing::invoice::Invoice::split_evenly".to_string(),
            },
        )
    }

    fn proposal() -> FixProposal {
        FixProposal {
            proposed_fix: "pub fn split_evenly() {}".to_string(),
            explanation: "Guard against zero recipients.".to_string(),
            confidence: 0.85,
            is_valid: true,
            provider: "mock".to_string(),
        }
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(branch_name(&event()), "mender/fix-01234567-split-evenly");
    }

    #[test]
    fn test_branch_name_without_function() {
        let event = FaultEvent::with_id("abcdef0123", "boom");
        assert_eq!(branch_name(&event), "mender/fix-abcdef01");
    }

    #[test]
    fn test_title_truncates_long_messages() {
        assert_eq!(
            title(&event()),
            "Fix: attempt to divide by zero in billing::invoice::Invoice::split_evenly"
        );

        let long = FaultEvent::with_id("e1", "x".repeat(200));
        let t = title(&long);
        assert!(t.ends_with("..."));
        assert!(t.len() < 80);
    }

    #[test]
    fn test_description_mentions_fault_and_confidence() {
        let body = description(&event(), &proposal());
        assert!(body.contains("`src/billing.rs:88`"));
        assert!(body.contains("Guard against zero recipients."));
        assert!(body.contains("**Confidence:** 85% (via mock)"));
    }

    #[test]
    fn test_build_targets_source_file() {
        let spec = build(&event(), &proposal(), None).unwrap();
        assert_eq!(spec.repository, None);
        assert_eq!(spec.base_branch, "main");
        assert_eq!(spec.changes.len(), 1);
        assert_eq!(spec.changes[0].path, "src/billing.rs");
        assert_eq!(spec.changes[0].content, "pub fn split_evenly() {}");
    }

    #[test]
    fn test_build_rejects_unknown_file() {
        let event = FaultEvent::with_id("e1", "boom");
        let err = build(&event, &proposal(), None).unwrap_err();
        assert!(matches!(err, MenderError::InvalidPullRequest(_)));
    }

    #[test]
    fn test_build_uses_configured_repository() {
        let repository = RepositoryConfig {
            owner: "acme".to_string(),
            name: "billing".to_string(),
            base_branch: "develop".to_string(),
        };
        let spec = build(&event(), &proposal(), Some(&repository)).unwrap();
        assert_eq!(spec.repository.as_deref(), Some("acme/billing"));
        assert_eq!(spec.base_branch, "develop");
    }

    #[test]
    fn test_validate() {
        let mut spec = build(&event(), &proposal(), None).unwrap();
        assert!(validate(&spec).is_ok());

        spec.changes[0].content.clear();
        assert!(validate(&spec).is_err());

        spec.changes.clear();
        assert!(validate(&spec).unwrap_err().to_string().contains("at least one"));

        spec.title = " ".to_string();
        assert!(validate(&spec).unwrap_err().to_string().contains("title"));

        spec.base_branch.clear();
        assert!(validate(&spec).unwrap_err().to_string().contains("base branch"));
    }
}
