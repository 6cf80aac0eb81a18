//! Ordered fan-out across fix generators
//!
//! Providers are tried in declaration order, each with its own attempt budget.
//! The first fully valid proposal wins. If none is fully valid, the
//! highest-confidence proposal seen is returned, earliest provider first on ties.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use mender_core::fail_open::fail_open_within;
use mender_core::{FixProposal, FixRequest, MenderError, Result};

use crate::collaborator::{ContextEnricher, FixGenerator};

/// Proposals below this confidence never count as fully valid
pub const MIN_VALID_CONFIDENCE: f64 = 0.3;

const DEFAULT_ATTEMPTS_PER_PROVIDER: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProviderChain {
    providers: Vec<Arc<dyn FixGenerator>>,
    enricher: Option<Arc<dyn ContextEnricher>>,
    attempts_per_provider: u32,
    retry_delay: Duration,
    enrichment_timeout: Duration,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn FixGenerator>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(MenderError::Config("no fix providers configured".to_string()));
        }
        Ok(Self {
            providers,
            enricher: None,
            attempts_per_provider: DEFAULT_ATTEMPTS_PER_PROVIDER,
            retry_delay: DEFAULT_RETRY_DELAY,
            enrichment_timeout: DEFAULT_ENRICHMENT_TIMEOUT,
        })
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ContextEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_attempts(mut self, attempts_per_provider: u32, retry_delay: Duration) -> Self {
        self.attempts_per_provider = attempts_per_provider.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.enrichment_timeout = timeout;
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Fully valid: non-empty fix, marked valid, confidence at least 0.3
    pub fn is_fully_valid(proposal: &FixProposal) -> bool {
        !proposal.proposed_fix.is_empty()
            && proposal.is_valid
            && proposal.confidence >= MIN_VALID_CONFIDENCE
    }

    async fn enrich(&self, request: &FixRequest) -> FixRequest {
        let mut request = request.clone();
        if let Some(enricher) = &self.enricher {
            let enrichment = fail_open_within("context_enrichment", self.enrichment_timeout, || {
                enricher.gather_context(&request)
            })
            .await;
            request.enrichment = enrichment;
        }
        request
    }
}

#[async_trait]
impl FixGenerator for ProviderChain {
    fn name(&self) -> &str {
        "provider-chain"
    }

    async fn generate_fix(&self, request: &FixRequest) -> Result<FixProposal> {
        let request = self.enrich(request).await;

        let mut best: Option<FixProposal> = None;
        let mut last_error: Option<MenderError> = None;

        for provider in &self.providers {
            debug!("Attempting fix generation with provider: {}", provider.name());

            for attempt in 1..=self.attempts_per_provider {
                match provider.generate_fix(&request).await {
                    Ok(mut proposal) => {
                        if proposal.provider.is_empty() {
                            proposal.provider = provider.name().to_string();
                        }
                        if Self::is_fully_valid(&proposal) {
                            info!(
                                "Generated fix with provider {} (attempt {}, confidence: {:.2})",
                                provider.name(),
                                attempt,
                                proposal.confidence
                            );
                            return Ok(proposal);
                        }
                        debug!(
                            "Provider {} returned a proposal that is not fully valid (confidence: {:.2}, valid: {})",
                            provider.name(),
                            proposal.confidence,
                            proposal.is_valid
                        );
                        if best
                            .as_ref()
                            .map_or(true, |b| proposal.confidence > b.confidence)
                        {
                            best = Some(proposal);
                        }
                    }
                    Err(e) => {
                        warn!("Provider {} attempt {} failed: {}", provider.name(), attempt, e);
                        last_error = Some(e);
                    }
                }

                if attempt < self.attempts_per_provider {
                    tokio::time::sleep(self.retry_delay).await;
                }
            }

            warn!(
                "Provider {} gave no fully valid fix after {} attempts",
                provider.name(),
                self.attempts_per_provider
            );
        }

        if let Some(best) = best {
            warn!(
                "No fully valid proposal found, returning best with confidence {:.2}",
                best.confidence
            );
            return Ok(best);
        }

        Err(MenderError::Analysis(format!(
            "all fix providers failed, last error: {}",
            last_error.map_or_else(|| "none".to_string(), |e| e.to_string())
        )))
    }

    fn validate_configuration(&self) -> Result<()> {
        let problems: Vec<String> = self
            .providers
            .iter()
            .filter_map(|p| {
                p.validate_configuration()
                    .err()
                    .map(|e| format!("{}: {}", p.name(), e))
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MenderError::Config(format!(
                "provider validation failed: {}",
                problems.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockContextEnricher, MockFixGenerator};

    fn proposal(confidence: f64, is_valid: bool) -> FixProposal {
        FixProposal {
            proposed_fix: "fn fixed() {}".to_string(),
            explanation: "explained".to_string(),
            confidence,
            is_valid,
            provider: String::new(),
        }
    }

    fn chain(providers: Vec<Arc<dyn FixGenerator>>) -> ProviderChain {
        ProviderChain::new(providers)
            .unwrap()
            .with_attempts(2, Duration::from_millis(1))
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(ProviderChain::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_first_valid_wins() {
        let first = Arc::new(MockFixGenerator::new("first").with_proposal(proposal(0.9, true)));
        let second = Arc::new(MockFixGenerator::new("second").with_proposal(proposal(0.95, true)));
        let chain = chain(vec![first.clone(), second.clone()]);

        let result = chain.generate_fix(&FixRequest::default()).await.unwrap();
        assert_eq!(result.provider, "first");
        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_after_failures() {
        let first = Arc::new(MockFixGenerator::new("first").always_failing());
        let second = Arc::new(MockFixGenerator::new("second").with_proposal(proposal(0.8, true)));
        let chain = chain(vec![first.clone(), second.clone()]);

        let result = chain.generate_fix(&FixRequest::default()).await.unwrap();
        assert_eq!(result.provider, "second");
        assert_eq!(first.call_count(), 2);
    }

    #[tokio::test]
    async fn test_best_effort_tie_goes_to_earliest() {
        let first = Arc::new(MockFixGenerator::new("first").with_proposal(proposal(0.6, false)));
        let second = Arc::new(MockFixGenerator::new("second").with_proposal(proposal(0.6, false)));
        let low = Arc::new(MockFixGenerator::new("low").with_proposal(proposal(0.2, true)));
        let chain = chain(vec![low, first, second]);

        let result = chain.generate_fix(&FixRequest::default()).await.unwrap();
        assert_eq!(result.provider, "first");
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn test_all_failed_wraps_last_error() {
        let chain = chain(vec![
            Arc::new(MockFixGenerator::new("a").always_failing()),
            Arc::new(MockFixGenerator::new("b").always_failing()),
        ]);

        let err = chain.generate_fix(&FixRequest::default()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("all fix providers failed"));
        assert!(msg.contains("mock provider b failed"));
    }

    #[tokio::test]
    async fn test_enrichment_attached() {
        let provider = Arc::new(MockFixGenerator::new("p").with_proposal(proposal(0.9, true)));
        let chain = chain(vec![provider.clone()])
            .with_enricher(Arc::new(MockContextEnricher::new().with_context("related docs")));

        chain.generate_fix(&FixRequest::default()).await.unwrap();
        let seen = provider.requests();
        assert_eq!(seen[0].enrichment.as_deref(), Some("related docs"));
    }

    #[tokio::test]
    async fn test_enrichment_failure_is_fail_open() {
        let provider = Arc::new(MockFixGenerator::new("p").with_proposal(proposal(0.9, true)));
        let chain = chain(vec![provider.clone()])
            .with_enricher(Arc::new(MockContextEnricher::new().failing()));

        assert!(chain.generate_fix(&FixRequest::default()).await.is_ok());
        assert_eq!(provider.requests()[0].enrichment, None);
    }

    #[test]
    fn test_validate_configuration_collects_errors() {
        let chain = chain(vec![
            Arc::new(MockFixGenerator::new("good")),
            Arc::new(MockFixGenerator::new("bad").with_invalid_configuration("missing api key")),
        ]);
        let err = chain.validate_configuration().unwrap_err().to_string();
        assert!(err.contains("bad: "));
        assert!(err.contains("missing api key"));
        assert!(!err.contains("good"));
    }
}
