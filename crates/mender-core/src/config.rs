//! Configuration management for Mender
//!
//! This module provides the configuration structures for the capture pipeline:
//! queue and worker sizing, retry and circuit breaker tuning, phase timeouts,
//! frame filtering, and the target repository for remediation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::trace::{default_internal_prefixes, FrameFilter};
use crate::{MenderError, Result};

pub const MAX_QUEUE_SIZE_LIMIT: usize = 10_000;
pub const MAX_WORKER_COUNT_LIMIT: usize = 50;
pub const MAX_RETRY_ATTEMPTS_LIMIT: u32 = 10;

/// Base branch used when no repository is configured
pub const DEFAULT_BASE_BRANCH: &str = "main";

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Repository-level Mender configuration
///
/// Loaded from `.mender/config.toml` in the repo root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenderConfig {
    /// When false, faults are still captured but no workers run
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Total attempts per event, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    /// Where remediation pull requests are opened
    #[serde(default)]
    pub repository: Option<RepositoryConfig>,
}

/// Backoff parameters for the retry executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit waits before letting a trial request through
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

/// Per-event pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_analyze_timeout_secs")]
    pub analyze_timeout_secs: u64,

    #[serde(default = "default_remediate_timeout_secs")]
    pub remediate_timeout_secs: u64,

    /// Minimum proposal confidence for opening a pull request
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// How long `stop` waits for workers to exit
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Fault capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Function/file prefixes treated as runtime or library frames
    #[serde(default = "default_internal_prefixes")]
    pub internal_prefixes: Vec<String>,
}

/// Target repository for remediation pull requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub owner: String,
    pub name: String,

    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

impl RepositoryConfig {
    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

// Default value providers
fn default_enabled() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    100
}

fn default_worker_count() -> usize {
    2
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_analyze_timeout_secs() -> u64 {
    45
}

fn default_remediate_timeout_secs() -> u64 {
    60
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_base_branch() -> String {
    DEFAULT_BASE_BRANCH.to_string()
}

impl MenderConfig {
    /// Load configuration from `.mender/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".mender/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.mender/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".mender");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| MenderError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Overlay `MENDER_*` environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MENDER_ENABLED") {
            self.enabled = parse_var("MENDER_ENABLED", &value)?;
        }
        if let Some(value) = lookup("MENDER_MAX_QUEUE_SIZE") {
            self.max_queue_size = parse_var("MENDER_MAX_QUEUE_SIZE", &value)?;
        }
        if let Some(value) = lookup("MENDER_WORKER_COUNT") {
            self.worker_count = parse_var("MENDER_WORKER_COUNT", &value)?;
        }
        if let Some(value) = lookup("MENDER_RETRY_ATTEMPTS") {
            self.retry_attempts = parse_var("MENDER_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("MENDER_LOG_LEVEL") {
            self.log_level = value.to_lowercase();
        }

        let owner = lookup("MENDER_REPO_OWNER");
        let name = lookup("MENDER_REPO_NAME");
        if owner.is_some() || name.is_some() {
            let mut repository = self.repository.clone().unwrap_or_else(|| RepositoryConfig {
                owner: String::new(),
                name: String::new(),
                base_branch: default_base_branch(),
            });
            if let Some(owner) = owner {
                repository.owner = owner;
            }
            if let Some(name) = name {
                repository.name = name;
            }
            self.repository = Some(repository);
        }

        Ok(())
    }

    /// Check every setting, reporting all problems in one error
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_queue_size == 0 {
            problems.push("max_queue_size must be greater than 0".to_string());
        } else if self.max_queue_size > MAX_QUEUE_SIZE_LIMIT {
            problems.push(format!(
                "max_queue_size must be at most {}",
                MAX_QUEUE_SIZE_LIMIT
            ));
        }

        if self.worker_count == 0 {
            problems.push("worker_count must be greater than 0".to_string());
        } else if self.worker_count > MAX_WORKER_COUNT_LIMIT {
            problems.push(format!(
                "worker_count must be at most {}",
                MAX_WORKER_COUNT_LIMIT
            ));
        }

        if self.retry_attempts == 0 {
            problems.push("retry_attempts must be greater than 0".to_string());
        } else if self.retry_attempts > MAX_RETRY_ATTEMPTS_LIMIT {
            problems.push(format!(
                "retry_attempts must be at most {}",
                MAX_RETRY_ATTEMPTS_LIMIT
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            problems.push(format!(
                "log_level must be one of {}, got '{}'",
                VALID_LOG_LEVELS.join("/"),
                self.log_level
            ));
        }

        if self.retry.backoff_factor < 1.0 {
            problems.push("retry.backoff_factor must be at least 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            problems.push("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.pipeline.confidence_threshold) {
            problems.push("pipeline.confidence_threshold must be between 0.0 and 1.0".to_string());
        }

        if self.capture.internal_prefixes.iter().any(|p| p.trim().is_empty()) {
            problems.push("capture.internal_prefixes must not contain empty entries".to_string());
        }

        if let Some(repository) = &self.repository {
            for (field, value) in [("owner", &repository.owner), ("name", &repository.name)] {
                if value.is_empty() || value.contains('/') || value.contains(char::is_whitespace) {
                    problems.push(format!(
                        "repository.{} must be non-empty without '/' or spaces, got '{}'",
                        field, value
                    ));
                }
            }
            let base = &repository.base_branch;
            if base.is_empty() || base.contains(char::is_whitespace) {
                problems.push(format!(
                    "repository.base_branch must be non-empty without spaces, got '{}'",
                    base
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MenderError::Config(problems.join("; ")))
        }
    }

    /// Human-readable summary of the effective configuration
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("enabled: {}", self.enabled),
            format!("max_queue_size: {}", self.max_queue_size),
            format!("worker_count: {}", self.worker_count),
            format!("retry_attempts: {}", self.retry_attempts),
            format!("log_level: {}", self.log_level),
            format!(
                "retry: initial {}ms, max {}ms, factor {}",
                self.retry.initial_delay_ms, self.retry.max_delay_ms, self.retry.backoff_factor
            ),
            format!(
                "circuit_breaker: threshold {}, recovery {}s, reset {}s",
                self.circuit_breaker.failure_threshold,
                self.circuit_breaker.recovery_timeout_secs,
                self.circuit_breaker.reset_timeout_secs
            ),
            format!(
                "pipeline: analyze {}s, remediate {}s, confidence {}",
                self.pipeline.analyze_timeout_secs,
                self.pipeline.remediate_timeout_secs,
                self.pipeline.confidence_threshold
            ),
        ];

        match &self.repository {
            Some(repo) => lines.push(format!(
                "repository: {}/{} (base {})",
                repo.owner, repo.name, repo.base_branch
            )),
            None => lines.push("repository: not configured".to_string()),
        }

        lines
    }

    pub fn frame_filter(&self) -> FrameFilter {
        FrameFilter::new(self.capture.internal_prefixes.clone())
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn remediate_timeout(&self) -> Duration {
        Duration::from_secs(self.remediate_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MenderError::Config(format!("{} has invalid value '{}'", key, value)))
}

impl Default for MenderConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_queue_size: default_max_queue_size(),
            worker_count: default_worker_count(),
            retry_attempts: default_retry_attempts(),
            log_level: default_log_level(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pipeline: PipelineConfig::default(),
            capture: CaptureConfig::default(),
            repository: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyze_timeout_secs: default_analyze_timeout_secs(),
            remediate_timeout_secs: default_remediate_timeout_secs(),
            confidence_threshold: default_confidence_threshold(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            internal_prefixes: default_internal_prefixes(),
        }
    }
}
