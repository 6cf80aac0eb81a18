//! Capture primitives against the global registry
//!
//! The registry and panic hook are process-wide, so every test here holds
//! `GLOBAL` for its whole body.

use parking_lot::Mutex;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use mender_agent::mock::MockFixGenerator;
use mender_core::{FixProposal, MenderConfig, ProcessingOutcome};
use mender_orchestrator::capture::{self, panic_message};
use mender_orchestrator::{registry, Orchestrator};
use tokio::sync::broadcast;

static GLOBAL: Mutex<()> = Mutex::new(());

fn config(max_queue_size: usize) -> MenderConfig {
    MenderConfig {
        max_queue_size,
        worker_count: 1,
        ..Default::default()
    }
}

/// Registered orchestrator that is not started, so captured events stay queued
fn idle(max_queue_size: usize) -> Arc<Orchestrator> {
    registry::clear();
    let orchestrator = Arc::new(Orchestrator::new(config(max_queue_size)).unwrap());
    orchestrator.install();
    orchestrator
}

/// Started orchestrator whose analyzer records each fix request
fn recording() -> (Arc<Orchestrator>, Arc<MockFixGenerator>) {
    registry::clear();
    let analyzer = Arc::new(MockFixGenerator::new("recorder").with_proposal(FixProposal {
        proposed_fix: String::new(),
        explanation: String::new(),
        confidence: 0.0,
        is_valid: false,
        provider: String::new(),
    }));
    let orchestrator = Arc::new(
        Orchestrator::builder(config(16))
            .with_fix_generator(analyzer.clone())
            .build()
            .unwrap(),
    );
    orchestrator.start().unwrap();
    orchestrator.install();
    (orchestrator, analyzer)
}

async fn next_outcome(rx: &mut broadcast::Receiver<ProcessingOutcome>) -> ProcessingOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no outcome within 5s")
        .expect("outcome channel closed")
}

#[tokio::test]
async fn test_rethrow_propagates_original_panic_and_records_site() {
    let _guard = GLOBAL.lock();
    let (orchestrator, analyzer) = recording();
    let mut outcomes = orchestrator.subscribe();

    let line = line!() + 2;
    let result = catch_unwind(|| {
        capture::capture_rethrow(|| -> u32 { panic!("ledger imbalance: {}", 42) })
    });

    let payload = result.unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "ledger imbalance: 42");

    next_outcome(&mut outcomes).await;
    let requests = analyzer.requests();
    let request = &requests[0];
    assert_eq!(request.fault_message, "ledger imbalance: 42");
    assert_eq!(
        request.metadata.get("source_file").map(String::as_str),
        Some(file!())
    );
    assert_eq!(
        request.metadata.get("line").map(String::as_str),
        Some(line.to_string().as_str())
    );

    orchestrator.stop().await.unwrap();
    orchestrator.uninstall();
}

#[test]
fn test_suppress_returns_none_and_queues() {
    let _guard = GLOBAL.lock();
    let orchestrator = idle(8);

    assert_eq!(capture::capture_suppress(|| 7), Some(7));
    assert_eq!(orchestrator.status().queue_length, 0);

    let result: Option<u32> = capture::capture_suppress(|| panic!("disk full"));
    assert_eq!(result, None);
    assert_eq!(orchestrator.status().queue_length, 1);

    orchestrator.uninstall();
}

#[test]
fn test_wrappers() {
    let _guard = GLOBAL.lock();
    let orchestrator = idle(8);

    let recovered = capture::wrap_with_recovery(|| -> u32 { panic!("wrapped") });
    assert_eq!(recovered(), None);

    let rethrown = capture::wrap(|| -> u32 { panic!("wrapped again") });
    assert!(catch_unwind(rethrown).is_err());

    let ok = capture::wrap(|| 5);
    assert_eq!(ok(), 5);

    assert_eq!(orchestrator.status().queue_length, 2);
    orchestrator.uninstall();
}

#[tokio::test]
async fn test_spawn_guarded_captures_task_panic() {
    let _guard = GLOBAL.lock();
    let orchestrator = idle(8);

    let ok = capture::spawn_guarded(async { 3 }).await.unwrap();
    assert_eq!(ok, Some(3));

    let failed = capture::spawn_guarded(async {
        tokio::task::yield_now().await;
        panic!("task blew up");
    })
    .await
    .unwrap();
    assert_eq!(failed, None::<()>);

    let thread = capture::spawn_thread_guarded(|| -> u32 { panic!("thread blew up") });
    assert_eq!(thread.join().unwrap(), None);

    assert_eq!(orchestrator.status().queue_length, 2);
    orchestrator.uninstall();
}

#[test]
fn test_capture_without_orchestrator_is_harmless() {
    let _guard = GLOBAL.lock();
    registry::clear();

    let result: Option<()> = capture::capture_suppress(|| panic!("nobody listening"));
    assert_eq!(result, None);
    assert!(!capture::report_fault("also nobody"));
}

#[test]
fn test_last_registered_orchestrator_wins() {
    let _guard = GLOBAL.lock();
    let first = idle(8);
    let second = Arc::new(Orchestrator::new(config(8)).unwrap());

    let previous = second.install().unwrap();
    assert!(Arc::ptr_eq(&previous, &first));

    let _: Option<()> = capture::capture_suppress(|| panic!("routed"));
    assert_eq!(first.status().queue_length, 0);
    assert_eq!(second.status().queue_length, 1);

    assert!(!first.uninstall());
    assert!(second.uninstall());
    assert!(!registry::is_installed());
}

#[test]
fn test_concurrent_capture_never_blocks() {
    let _guard = GLOBAL.lock();
    let orchestrator = idle(8);

    let threads: Vec<_> = (0..16)
        .map(|t| {
            std::thread::spawn(move || {
                for i in 0..50 {
                    capture::report_fault(format!("fault {}-{}", t, i));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let status = orchestrator.status();
    assert_eq!(status.queue_length, 8);
    assert_eq!(status.queue_length as u64 + status.dropped_events, 800);
    orchestrator.uninstall();
}

#[test]
fn test_panic_hook_install_and_restore() {
    let _guard = GLOBAL.lock();
    capture::restore_panic_hook();

    assert!(capture::install_panic_hook());
    assert!(!capture::install_panic_hook());
    assert!(capture::is_panic_hook_installed());

    assert!(capture::restore_panic_hook());
    assert!(!capture::restore_panic_hook());
    assert!(!capture::is_panic_hook_installed());
}
