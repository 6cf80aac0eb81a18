//! In-memory collaborators for tests and demos

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mender_core::{FixProposal, FixRequest, MenderError, PullRequestSpec, Result};

use crate::collaborator::{ContextEnricher, FixGenerator, PullRequestClient};

/// Mock fix generator
///
/// Returns the configured proposal after failing the first `failures` calls.
pub struct MockFixGenerator {
    name: String,
    proposal: FixProposal,
    failures: u32,
    delay: Option<Duration>,
    config_error: Option<String>,
    calls: AtomicU32,
    requests: Mutex<Vec<FixRequest>>,
}

impl MockFixGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proposal: FixProposal {
                proposed_fix: "// fixed".to_string(),
                explanation: "mock fix".to_string(),
                confidence: 0.9,
                is_valid: true,
                provider: String::new(),
            },
            failures: 0,
            delay: None,
            config_error: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_proposal(mut self, proposal: FixProposal) -> Self {
        self.proposal = proposal;
        self
    }

    /// Fail the first `failures` calls
    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn always_failing(self) -> Self {
        self.with_failures(u32::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_invalid_configuration(mut self, reason: impl Into<String>) -> Self {
        self.config_error = Some(reason.into());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FixRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl FixGenerator for MockFixGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_fix(&self, request: &FixRequest) -> Result<FixProposal> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call < self.failures {
            return Err(MenderError::Analysis(format!(
                "mock provider {} failed",
                self.name
            )));
        }
        Ok(self.proposal.clone())
    }

    fn validate_configuration(&self) -> Result<()> {
        match &self.config_error {
            Some(reason) => Err(MenderError::Config(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Mock hosting client that records every pull request it is asked to open
#[derive(Default)]
pub struct MockPullRequestClient {
    failures: u32,
    delay: Option<Duration>,
    calls: AtomicU32,
    created: Mutex<Vec<PullRequestSpec>>,
}

impl MockPullRequestClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `failures` calls
    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn always_failing(self) -> Self {
        self.with_failures(u32::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Pull requests that were opened successfully
    pub fn created(&self) -> Vec<PullRequestSpec> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PullRequestClient for MockPullRequestClient {
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call < self.failures {
            return Err(MenderError::Remediation(format!(
                "mock hosting failed to open {}",
                spec.branch_name
            )));
        }
        self.created.lock().push(spec.clone());
        Ok(())
    }
}

/// Mock context enricher
#[derive(Default)]
pub struct MockContextEnricher {
    context: String,
    failing: bool,
}

impl MockContextEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl ContextEnricher for MockContextEnricher {
    async fn gather_context(&self, _request: &FixRequest) -> Result<String> {
        if self.failing {
            return Err(MenderError::Other("context source unavailable".to_string()));
        }
        Ok(self.context.clone())
    }
}
