//! # mender-core
//!
//! Core types for Mender, an in-process fault capture and remediation layer.
//!
//! A captured fault becomes a [`FaultEvent`]; the orchestrator queues it, a
//! worker analyzes it through a fix generator, and a confident proposal is
//! turned into a pull request against the configured repository.

pub mod config;
mod error;
pub mod fail_open;
pub mod trace;
mod types;

pub use config::MenderConfig;
pub use error::{MenderError, PhaseFailure, Result};
pub use trace::{FrameFilter, StackFrame};
pub use types::*;
