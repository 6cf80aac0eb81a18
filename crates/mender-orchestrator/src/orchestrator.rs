//! Core orchestrator implementation

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_agent::{CircuitBreaker, FixGenerator, PullRequestClient};
use mender_core::{
    FaultEvent, FrameFilter, MenderConfig, MenderError, ProcessingOutcome, Result,
    SourceLocation, StackFrame,
};

use crate::capture::{self, BacktraceSource, PanicSite, TraceSource};
use crate::pipeline::{EventProcessor, PipelineCounts};
use crate::queue::FaultQueue;
use crate::registry;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::worker::WorkerPool;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time status of an orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub enabled: bool,
    pub queue_capacity: usize,
    pub queue_length: usize,
    pub queue_available: usize,
    pub dropped_events: u64,
    pub worker_count: usize,
    pub workers_running: bool,
    pub circuit_breaker_state: String,
    pub circuit_breaker_failures: u32,
    pub events: PipelineCounts,
}

/// Builder for an [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: MenderConfig,
    analyzer: Option<Arc<dyn FixGenerator>>,
    hosting: Option<Arc<dyn PullRequestClient>>,
    trace_source: Arc<dyn TraceSource>,
}

impl OrchestratorBuilder {
    pub fn new(config: MenderConfig) -> Self {
        Self {
            config,
            analyzer: None,
            hosting: None,
            trace_source: Arc::new(BacktraceSource),
        }
    }

    pub fn with_fix_generator(mut self, analyzer: Arc<dyn FixGenerator>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_pull_request_client(mut self, hosting: Arc<dyn PullRequestClient>) -> Self {
        self.hosting = Some(hosting);
        self
    }

    pub fn with_trace_source(mut self, trace_source: Arc<dyn TraceSource>) -> Self {
        self.trace_source = trace_source;
        self
    }

    /// Validate the configuration and wire the pipeline together
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let config = self.config;
        let queue = Arc::new(FaultQueue::new(config.max_queue_size));
        let breaker = Arc::new(CircuitBreaker::from_config(&config.circuit_breaker));
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        let processor = EventProcessor::new(
            self.analyzer,
            self.hosting,
            RetryExecutor::new(RetryPolicy::from_config(&config)),
            Arc::clone(&breaker),
            config.pipeline.clone(),
            outcomes.clone(),
        )
        .with_repository(config.repository.clone());
        let processor = Arc::new(processor);

        let pool = WorkerPool::new(
            config.worker_count,
            config.pipeline.shutdown_timeout(),
            Arc::clone(&queue),
            Arc::clone(&processor),
        );

        Ok(Orchestrator {
            filter: config.frame_filter(),
            config,
            queue,
            breaker,
            processor,
            pool,
            trace_source: self.trace_source,
            root: Mutex::new(None),
            outcomes,
        })
    }

    /// Build, start, register globally and install the panic hook
    pub fn install(self) -> Result<Arc<Orchestrator>> {
        let orchestrator = Arc::new(self.build()?);
        orchestrator.start()?;
        orchestrator.install();
        Ok(orchestrator)
    }
}

/// Owns the queue, worker pool, retry policy and circuit breaker
pub struct Orchestrator {
    config: MenderConfig,
    queue: Arc<FaultQueue>,
    breaker: Arc<CircuitBreaker>,
    processor: Arc<EventProcessor>,
    pool: WorkerPool,
    filter: FrameFilter,
    trace_source: Arc<dyn TraceSource>,
    root: Mutex<Option<CancellationToken>>,
    outcomes: broadcast::Sender<ProcessingOutcome>,
}

impl Orchestrator {
    pub fn builder(config: MenderConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Orchestrator without collaborators; events complete after capture
    pub fn new(config: MenderConfig) -> Result<Self> {
        OrchestratorBuilder::new(config).build()
    }

    pub fn config(&self) -> &MenderConfig {
        &self.config
    }

    /// Start the worker pool on the current tokio runtime
    ///
    /// When disabled in configuration this is a logged no-op; capture keeps
    /// queueing events but nothing processes them.
    pub fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Mender is disabled, not starting workers");
            return Ok(());
        }

        let mut root = self.root.lock();
        if root.is_some() {
            return Err(MenderError::Worker("orchestrator already running".to_string()));
        }

        let token = CancellationToken::new();
        self.pool.start(&token)?;
        *root = Some(token);

        info!(
            "Mender started (workers: {}, queue capacity: {})",
            self.config.worker_count,
            self.queue.capacity()
        );
        Ok(())
    }

    /// Cancel in-flight work and stop the workers
    ///
    /// Queued events stay queued. Calling stop on a stopped orchestrator is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let token = self.root.lock().take();
        let Some(token) = token else {
            return Ok(());
        };

        info!("Stopping Mender");
        token.cancel();
        self.pool.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Register as the global orchestrator and install the panic hook
    ///
    /// Returns the previously registered orchestrator, if any.
    pub fn install(self: &Arc<Self>) -> Option<Arc<Self>> {
        capture::install_panic_hook();
        registry::set(Arc::clone(self))
    }

    /// Remove from the global registry if still registered
    pub fn uninstall(self: &Arc<Self>) -> bool {
        registry::clear_if(self)
    }

    /// Build a fault event and offer it to the queue
    ///
    /// Runs on the faulting call path: synchronous, non-blocking, and never
    /// fails. Returns whether the event was queued.
    pub fn capture_fault(&self, message: String, site: Option<PanicSite>) -> bool {
        let (frames, location) = match site {
            Some(site) => {
                let location = self.site_location(&site);
                (site.frames, location)
            }
            None => (self.trace_source.capture(), None),
        };

        let event = FaultEvent::from_frames(message, &frames, &self.filter, location);
        error!("{}", event.summary());
        debug!("Stack trace for event {}:\n{}", event.id(), event.stack_trace());

        let event_id = event.id().clone();
        let accepted = self.queue.enqueue(event);
        if !accepted {
            warn!("Fault event {} was not queued", event_id);
        }
        accepted
    }

    /// Capture a non-panic fault at the caller's stack
    pub fn report_fault(&self, message: impl Into<String>) -> bool {
        self.capture_fault(message.into(), None)
    }

    /// Receive the outcome of every event processed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingOutcome> {
        self.outcomes.subscribe()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            enabled: self.config.enabled,
            queue_capacity: self.queue.capacity(),
            queue_length: self.queue.len(),
            queue_available: self.queue.available(),
            dropped_events: self.queue.dropped_count(),
            worker_count: self.pool.worker_count(),
            workers_running: self.pool.is_running(),
            circuit_breaker_state: self.breaker.state().to_string(),
            circuit_breaker_failures: self.breaker.failure_count(),
            events: self.processor.stats(),
        }
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Exact panic location, with the function taken from the site's frames
    fn site_location(&self, site: &PanicSite) -> Option<SourceLocation> {
        if site.file.is_empty() {
            return None;
        }
        let site_frame = StackFrame::new(String::new()).with_location(site.file.clone(), site.line);
        if self.filter.is_internal(&site_frame) {
            return None;
        }

        let function = self
            .filter
            .first_caller_frame(&site.frames)
            .map(|frame| frame.function.clone())
            .unwrap_or_default();

        Some(SourceLocation {
            file: site.file.clone(),
            line: site.line,
            function,
        })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
