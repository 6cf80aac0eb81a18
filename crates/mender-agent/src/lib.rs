//! # mender-agent
//!
//! Collaborators for the Mender pipeline.
//!
//! - [`FixGenerator`] turns a fault into a proposed fix; [`ProviderChain`]
//!   fans out across several generators with fallback
//! - [`PullRequestClient`] opens the remediation pull request
//! - [`CircuitBreaker`] guards both against a collaborator that keeps failing
//!
//! Concrete provider and hosting clients live with the embedding application;
//! the `mock` module provides in-memory versions for tests and demos.

mod circuit_breaker;
mod collaborator;
pub mod mock;
mod provider_chain;
pub mod pull_request;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use collaborator::{ContextEnricher, FixGenerator, PullRequestClient};
pub use provider_chain::{ProviderChain, MIN_VALID_CONFIDENCE};
