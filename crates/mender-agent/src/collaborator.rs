//! Collaborator interfaces for fix generation and pull request creation
//!
//! The pipeline only talks to providers and hosting APIs through these traits,
//! so real clients and test doubles are interchangeable.

use async_trait::async_trait;
use mender_core::{FixProposal, FixRequest, PullRequestSpec, Result};

/// Produces a fix proposal for a captured fault
#[async_trait]
pub trait FixGenerator: Send + Sync {
    /// Provider name used in logs and on the returned proposal
    fn name(&self) -> &str;

    async fn generate_fix(&self, request: &FixRequest) -> Result<FixProposal>;

    /// Check credentials/settings without making a generation call
    fn validate_configuration(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens a branch, commits the file changes and opens a pull request
#[async_trait]
pub trait PullRequestClient: Send + Sync {
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<()>;
}

/// Gathers extra context for a fix request (documentation lookups, related
/// code, previous incidents). Failures never block fix generation.
#[async_trait]
pub trait ContextEnricher: Send + Sync {
    async fn gather_context(&self, request: &FixRequest) -> Result<String>;
}
