//! End-to-end processing through the orchestrator with mock collaborators

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

use mender_agent::mock::{MockContextEnricher, MockFixGenerator, MockPullRequestClient};
use mender_agent::{FixGenerator, ProviderChain};
use mender_core::{EventStatus, FixProposal, MenderConfig, ProcessingOutcome, StackFrame};
use mender_orchestrator::{Orchestrator, TraceSource};

struct FixedTrace;

impl TraceSource for FixedTrace {
    fn capture(&self) -> Vec<StackFrame> {
        vec![
            StackFrame::new("mender_orchestrator::orchestrator::Orchestrator::report_fault")
                .with_location("crates/mender-orchestrator/src/orchestrator.rs", 231),
            StackFrame::new("billing::invoice::total_due").with_location("src/invoice.rs", 88),
            StackFrame::new("billing::main").with_location("src/main.rs", 12),
        ]
    }
}

fn proposal(confidence: f64) -> FixProposal {
    FixProposal {
        proposed_fix: "pub fn total_due(lines: &[Line]) -> u64 { 0 }".to_string(),
        explanation: "guard against an empty invoice".to_string(),
        confidence,
        is_valid: true,
        provider: String::new(),
    }
}

fn fast_config() -> MenderConfig {
    let mut config = MenderConfig {
        worker_count: 2,
        max_queue_size: 16,
        ..Default::default()
    };
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

async fn next_outcome(rx: &mut broadcast::Receiver<ProcessingOutcome>) -> ProcessingOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no outcome within 5s")
        .expect("outcome channel closed")
}

#[tokio::test]
async fn test_config_file_drives_provider_fallback() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join(".mender")).unwrap();
    std::fs::write(
        temp_dir.path().join(".mender/config.toml"),
        r#"
worker_count = 1
max_queue_size = 4
retry_attempts = 2

[retry]
initial_delay_ms = 1
max_delay_ms = 2

[pipeline]
confidence_threshold = 0.5

[repository]
owner = "acme"
name = "billing"
base_branch = "release"
"#,
    )
    .unwrap();
    let config = MenderConfig::load_or_default(temp_dir.path()).unwrap();
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.pipeline.confidence_threshold, 0.5);

    let primary = Arc::new(MockFixGenerator::new("primary").always_failing());
    let secondary = Arc::new(MockFixGenerator::new("secondary").with_proposal(proposal(0.6)));
    let providers: Vec<Arc<dyn FixGenerator>> = vec![primary.clone(), secondary.clone()];
    let chain = ProviderChain::new(providers)
        .unwrap()
        .with_attempts(1, Duration::from_millis(1))
        .with_enricher(Arc::new(MockContextEnricher::new().with_context("recent deploy")));
    let hosting = Arc::new(MockPullRequestClient::new());

    let orchestrator = Orchestrator::builder(config)
        .with_fix_generator(Arc::new(chain))
        .with_pull_request_client(hosting.clone())
        .with_trace_source(Arc::new(FixedTrace))
        .build()
        .unwrap();
    let mut outcomes = orchestrator.subscribe();
    orchestrator.start().unwrap();

    assert!(orchestrator.report_fault("total_due underflowed"));
    let outcome = next_outcome(&mut outcomes).await;

    assert_eq!(outcome.status, EventStatus::Completed);
    assert!(outcome.pull_request.unwrap().starts_with("Fix: total_due underflowed"));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 1);
    assert_eq!(
        secondary.requests()[0].enrichment.as_deref(),
        Some("recent deploy")
    );

    let created = hosting.created();
    assert_eq!(created.len(), 1);
    assert!(created[0].branch_name.starts_with("mender/fix-"));
    assert!(created[0].branch_name.ends_with("-total-due"));
    assert_eq!(created[0].changes[0].path, "src/invoice.rs");
    assert_eq!(created[0].repository.as_deref(), Some("acme/billing"));
    assert_eq!(created[0].base_branch, "release");

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_hosting_failure_retries_whole_pipeline() {
    let analyzer = Arc::new(MockFixGenerator::new("mock").with_proposal(proposal(0.9)));
    let hosting = Arc::new(MockPullRequestClient::new().with_failures(1));

    let orchestrator = Orchestrator::builder(fast_config())
        .with_fix_generator(analyzer.clone())
        .with_pull_request_client(hosting.clone())
        .with_trace_source(Arc::new(FixedTrace))
        .build()
        .unwrap();
    let mut outcomes = orchestrator.subscribe();
    orchestrator.start().unwrap();

    orchestrator.report_fault("total_due underflowed");
    let outcome = next_outcome(&mut outcomes).await;

    assert!(outcome.is_success());
    assert_eq!(analyzer.call_count(), 2);
    assert_eq!(hosting.call_count(), 2);
    assert_eq!(hosting.created().len(), 1);
    assert_eq!(orchestrator.status().circuit_breaker_failures, 0);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_low_confidence_completes_without_pull_request() {
    let analyzer = Arc::new(MockFixGenerator::new("unsure").with_proposal(proposal(0.4)));
    let hosting = Arc::new(MockPullRequestClient::new());

    let orchestrator = Orchestrator::builder(fast_config())
        .with_fix_generator(analyzer)
        .with_pull_request_client(hosting.clone())
        .with_trace_source(Arc::new(FixedTrace))
        .build()
        .unwrap();
    let mut outcomes = orchestrator.subscribe();
    orchestrator.start().unwrap();

    orchestrator.report_fault("total_due underflowed");
    let outcome = next_outcome(&mut outcomes).await;

    assert_eq!(outcome.status, EventStatus::Completed);
    assert!(outcome.pull_request.is_none());
    assert_eq!(hosting.call_count(), 0);

    let counts = orchestrator.status().events;
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.skipped, 1);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_in_flight_analysis() {
    let analyzer = Arc::new(
        MockFixGenerator::new("slow")
            .with_proposal(proposal(0.9))
            .with_delay(Duration::from_secs(60)),
    );
    let orchestrator = Orchestrator::builder(fast_config())
        .with_fix_generator(analyzer.clone())
        .with_trace_source(Arc::new(FixedTrace))
        .build()
        .unwrap();
    let mut outcomes = orchestrator.subscribe();
    orchestrator.start().unwrap();

    orchestrator.report_fault("total_due underflowed");
    let deadline = Instant::now() + Duration::from_secs(5);
    while analyzer.call_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(analyzer.call_count(), 1);

    let started = Instant::now();
    orchestrator.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!orchestrator.is_running());

    let outcome = next_outcome(&mut outcomes).await;
    assert_eq!(outcome.status, EventStatus::Failed);
    assert!(outcome.error.unwrap().contains("cancelled"));
    assert_eq!(analyzer.call_count(), 1);
}

#[tokio::test]
async fn test_overflow_keeps_newest_events() {
    let mut config = fast_config();
    config.max_queue_size = 2;
    let analyzer = Arc::new(MockFixGenerator::new("mock").with_proposal(proposal(0.0)));
    let orchestrator = Orchestrator::builder(config)
        .with_fix_generator(analyzer.clone())
        .with_trace_source(Arc::new(FixedTrace))
        .build()
        .unwrap();

    for message in ["first", "second", "third"] {
        assert!(orchestrator.report_fault(message));
    }
    let status = orchestrator.status();
    assert_eq!(status.queue_length, 2);
    assert_eq!(status.dropped_events, 1);

    let mut outcomes = orchestrator.subscribe();
    orchestrator.start().unwrap();
    next_outcome(&mut outcomes).await;
    next_outcome(&mut outcomes).await;

    let mut seen: Vec<String> = analyzer
        .requests()
        .into_iter()
        .map(|request| request.fault_message)
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["second".to_string(), "third".to_string()]);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_after_stop() {
    let orchestrator = Orchestrator::new(fast_config()).unwrap();

    orchestrator.start().unwrap();
    orchestrator.stop().await.unwrap();
    orchestrator.start().unwrap();
    assert!(orchestrator.is_running());
    orchestrator.stop().await.unwrap();
    assert!(!orchestrator.is_running());
}
