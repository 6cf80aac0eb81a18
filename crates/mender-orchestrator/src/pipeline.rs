//! Per-event analyze/remediate pipeline
//!
//! Each event runs under the retry executor, which wraps the shared circuit
//! breaker, which wraps the two phases. Every phase has its own deadline and
//! observes the root cancellation token.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_agent::{pull_request, CircuitBreaker, FixGenerator, PullRequestClient};
use mender_core::config::{PipelineConfig, RepositoryConfig};
use mender_core::{
    EventStatus, FaultEvent, FixRequest, MenderError, PhaseFailure, ProcessingOutcome, Result,
};

use crate::retry::RetryExecutor;

pub const ANALYZE_PHASE: &str = "analyze";
pub const REMEDIATE_PHASE: &str = "remediate";

/// Why an event finished without opening a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoAnalyzer,
    NoHostingClient,
    NotActionable,
    UnknownSourceFile,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAnalyzer => write!(f, "no fix generator configured"),
            Self::NoHostingClient => write!(f, "no pull request client configured"),
            Self::NotActionable => {
                write!(f, "proposal missing, invalid or below confidence threshold")
            }
            Self::UnknownSourceFile => write!(f, "fault source file unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipelineResult {
    Remediated { title: String },
    Skipped(SkipReason),
}

/// Counters over all processed events
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Completed without opening a pull request
    pub skipped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounts {
        PipelineCounts {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Drives one event through analysis and remediation
pub struct EventProcessor {
    analyzer: Option<Arc<dyn FixGenerator>>,
    hosting: Option<Arc<dyn PullRequestClient>>,
    retry: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
    config: PipelineConfig,
    repository: Option<RepositoryConfig>,
    stats: PipelineStats,
    outcomes: broadcast::Sender<ProcessingOutcome>,
}

impl EventProcessor {
    pub fn new(
        analyzer: Option<Arc<dyn FixGenerator>>,
        hosting: Option<Arc<dyn PullRequestClient>>,
        retry: RetryExecutor,
        breaker: Arc<CircuitBreaker>,
        config: PipelineConfig,
        outcomes: broadcast::Sender<ProcessingOutcome>,
    ) -> Self {
        Self {
            analyzer,
            hosting,
            retry,
            breaker,
            config,
            repository: None,
            stats: PipelineStats::default(),
            outcomes,
        }
    }

    /// Open pull requests against `repository` instead of the client's default
    pub fn with_repository(mut self, repository: Option<RepositoryConfig>) -> Self {
        self.repository = repository;
        self
    }

    pub fn stats(&self) -> PipelineCounts {
        self.stats.snapshot()
    }

    /// Process a dequeued event to a terminal status
    ///
    /// Never returns an error; failures are logged, counted and published.
    pub async fn process(
        &self,
        worker_id: usize,
        mut event: FaultEvent,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = event.mark_processing() {
            warn!("Worker {} skipping event: {}", worker_id, e);
            return;
        }
        info!(
            "Worker {} processing event {}: {}",
            worker_id,
            event.id(),
            event.summary()
        );

        let operation = format!("process-event-{}", event.id());
        let result = self
            .retry
            .execute_with_retry(&operation, cancel, || self.attempt(&operation, &event, cancel))
            .await;

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let outcome = match result {
            Ok(pipeline) => {
                if let Err(e) = event.mark_completed() {
                    warn!("Worker {}: {}", worker_id, e);
                }
                self.stats.completed.fetch_add(1, Ordering::Relaxed);

                let pull_request = match pipeline {
                    PipelineResult::Remediated { title } => {
                        info!(
                            "Worker {} opened pull request for event {}: {}",
                            worker_id,
                            event.id(),
                            title
                        );
                        Some(title)
                    }
                    PipelineResult::Skipped(reason) => {
                        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Worker {} completed event {} without a pull request: {}",
                            worker_id,
                            event.id(),
                            reason
                        );
                        None
                    }
                };

                ProcessingOutcome {
                    event_id: event.id().clone(),
                    status: EventStatus::Completed,
                    pull_request,
                    error: None,
                    processed_at: Utc::now(),
                }
            }
            Err(e) => {
                if let Err(transition) = event.mark_failed() {
                    warn!("Worker {}: {}", worker_id, transition);
                }
                self.stats.failed.fetch_add(1, Ordering::Relaxed);

                if e.is_cancellation() {
                    info!("Worker {} abandoned event {}: {}", worker_id, event.id(), e);
                } else {
                    error!("Worker {} failed event {}: {}", worker_id, event.id(), e);
                }

                ProcessingOutcome {
                    event_id: event.id().clone(),
                    status: EventStatus::Failed,
                    pull_request: None,
                    error: Some(e.to_string()),
                    processed_at: Utc::now(),
                }
            }
        };

        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    async fn attempt(
        &self,
        operation: &str,
        event: &FaultEvent,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        self.breaker
            .execute(operation, || self.run_pipeline(event, cancel))
            .await
    }

    async fn run_pipeline(
        &self,
        event: &FaultEvent,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let Some(analyzer) = &self.analyzer else {
            debug!("No fix generator configured, skipping analysis for {}", event.id());
            return Ok(PipelineResult::Skipped(SkipReason::NoAnalyzer));
        };

        let request = FixRequest::from_event(event);
        let proposal = run_phase(
            ANALYZE_PHASE,
            self.config.analyze_timeout(),
            cancel,
            analyzer.generate_fix(&request),
        )
        .await?;

        info!(
            "Generated fix for event {} (confidence: {:.2}, valid: {})",
            event.id(),
            proposal.confidence,
            proposal.is_valid
        );

        if !proposal.is_actionable(self.config.confidence_threshold) {
            debug!(
                "Fix for event {} not actionable (confidence {:.2}, threshold {:.2})",
                event.id(),
                proposal.confidence,
                self.config.confidence_threshold
            );
            return Ok(PipelineResult::Skipped(SkipReason::NotActionable));
        }

        let Some(hosting) = &self.hosting else {
            debug!(
                "No pull request client configured, skipping remediation for {}",
                event.id()
            );
            return Ok(PipelineResult::Skipped(SkipReason::NoHostingClient));
        };

        if event.location().file.is_empty() {
            debug!("Source file unknown for event {}, skipping remediation", event.id());
            return Ok(PipelineResult::Skipped(SkipReason::UnknownSourceFile));
        }

        let title = run_phase(
            REMEDIATE_PHASE,
            self.config.remediate_timeout(),
            cancel,
            async {
                let spec = pull_request::build(event, &proposal, self.repository.as_ref())?;
                hosting.create_pull_request(&spec).await?;
                Ok(spec.title)
            },
        )
        .await?;

        Ok(PipelineResult::Remediated { title })
    }
}

/// Run one phase under its deadline and the cancellation token
pub(crate) async fn run_phase<T, Fut>(
    phase: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    debug!("Starting phase '{}' (deadline {:?})", phase, limit);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err((PhaseFailure::Cancelled, MenderError::cancelled(phase))),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err((PhaseFailure::Operation, e)),
            Err(_) => Err((
                PhaseFailure::DeadlineExceeded,
                MenderError::Other(format!("no result within {:?}", limit)),
            )),
        },
    };

    outcome.map_err(|(failure, source)| MenderError::Phase {
        phase,
        failure,
        elapsed: started.elapsed(),
        source: Box::new(source),
    })
}
