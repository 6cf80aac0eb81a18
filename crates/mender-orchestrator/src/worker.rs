//! Worker pool draining the fault queue

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_core::{MenderError, Result};

use crate::capture::panic_message;
use crate::pipeline::EventProcessor;
use crate::queue::FaultQueue;

#[derive(Default)]
struct PoolState {
    token: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed set of tasks consuming the queue
pub struct WorkerPool {
    worker_count: usize,
    shutdown_timeout: Duration,
    queue: Arc<FaultQueue>,
    processor: Arc<EventProcessor>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        worker_count: usize,
        shutdown_timeout: Duration,
        queue: Arc<FaultQueue>,
        processor: Arc<EventProcessor>,
    ) -> Self {
        Self {
            worker_count,
            shutdown_timeout,
            queue,
            processor,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Spawn `worker_count` workers on the current tokio runtime
    ///
    /// Workers observe a child of `parent`, so cancelling the root token also
    /// stops them. If any worker fails to spawn, the ones already started are
    /// stopped and the error returned.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        if state.token.is_some() {
            return Err(MenderError::Worker("worker pool already running".to_string()));
        }

        let token = parent.child_token();
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.worker_count);

        for id in 0..self.worker_count {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(e) => {
                    token.cancel();
                    for worker in &workers {
                        worker.abort();
                    }
                    return Err(MenderError::Worker(format!(
                        "failed to start worker {}: {}",
                        id, e
                    )));
                }
            };

            workers.push(handle.spawn(run_worker(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.processor),
                token.child_token(),
            )));
        }

        info!("Started {} workers", workers.len());
        state.token = Some(token);
        state.workers = workers;
        Ok(())
    }

    /// Cancel all workers and wait for them to exit
    ///
    /// Waits at most the shutdown timeout, then proceeds with a warning.
    /// Stopping a pool that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (token, workers) = {
            let mut state = self.state.lock();
            match state.token.take() {
                Some(token) => (token, std::mem::take(&mut state.workers)),
                None => return Ok(()),
            }
        };

        let count = workers.len();
        token.cancel();

        match tokio::time::timeout(self.shutdown_timeout, join_all(workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            warn!("Worker exited abnormally: {}", e);
                        }
                    }
                }
                info!("Stopped {} workers", count);
            }
            Err(_) => {
                warn!(
                    "Timed out after {:?} waiting for {} workers to stop",
                    self.shutdown_timeout, count
                );
            }
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().token.is_some()
    }

    /// Number of live workers, zero when stopped
    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<FaultQueue>,
    processor: Arc<EventProcessor>,
    token: CancellationToken,
) {
    debug!("Worker {} started", id);

    while let Some(event) = queue.dequeue(&token).await {
        let event_id = event.id().clone();
        let processing = AssertUnwindSafe(processor.process(id, event, &token)).catch_unwind();
        if let Err(payload) = processing.await {
            error!(
                "Worker {} panicked while processing event {}: {}",
                id,
                event_id,
                panic_message(payload.as_ref())
            );
        }
    }

    debug!("Worker {} stopped", id);
}
