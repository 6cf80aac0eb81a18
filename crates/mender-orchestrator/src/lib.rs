//! # mender-orchestrator
//!
//! Background fault processing for Mender.
//!
//! This crate provides:
//! - A bounded fault queue that drops the oldest event on overflow
//! - A retry executor with deterministic exponential backoff
//! - A worker pool running the analyze/remediate pipeline behind the circuit breaker
//! - Capture primitives, a chained panic hook and the global registry
//! - The [`Orchestrator`] that owns all of the above
//!
//! ```no_run
//! use mender_core::MenderConfig;
//! use mender_orchestrator::{capture, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> mender_core::Result<()> {
//!     let orchestrator = Orchestrator::builder(MenderConfig::default()).install()?;
//!
//!     capture::capture_suppress(|| {
//!         let v: Vec<u32> = Vec::new();
//!         v[3]
//!     });
//!
//!     orchestrator.stop().await
//! }
//! ```

pub mod capture;
mod orchestrator;
mod pipeline;
mod queue;
pub mod registry;
mod retry;
mod worker;

pub use capture::{
    capture_rethrow, capture_suppress, install_panic_hook, restore_panic_hook, spawn_guarded,
    spawn_thread_guarded, wrap, wrap_with_recovery, BacktraceSource, PanicSite, TraceSource,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorStatus};
pub use pipeline::{EventProcessor, PipelineCounts, SkipReason, ANALYZE_PHASE, REMEDIATE_PHASE};
pub use queue::FaultQueue;
pub use retry::{RetryExecutor, RetryPolicy};
pub use worker::WorkerPool;
