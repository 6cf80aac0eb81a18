//! Fault capture entry points
//!
//! Two primitives turn a panic into a queued [`FaultEvent`](mender_core::FaultEvent):
//! [`capture_rethrow`] resumes the unwind afterwards, [`capture_suppress`]
//! swallows it. Both report to the globally registered orchestrator and never
//! block on the background pipeline.
//!
//! With [`install_panic_hook`] active, the exact panic location and the stack at
//! the panic site are recorded before unwinding starts, so events point at the
//! faulting line rather than at the recovery boundary.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo, UnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use mender_core::trace::parse_backtrace;
use mender_core::StackFrame;

use crate::registry;

/// Supplies the current call stack as ordered frames, innermost first
pub trait TraceSource: Send + Sync {
    fn capture(&self) -> Vec<StackFrame>;
}

/// Trace source backed by `std::backtrace`
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceSource;

impl TraceSource for BacktraceSource {
    fn capture(&self) -> Vec<StackFrame> {
        parse_backtrace(&Backtrace::force_capture().to_string())
    }
}

/// What the panic hook observed at the panic site
#[derive(Debug, Clone, PartialEq)]
pub struct PanicSite {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub frames: Vec<StackFrame>,
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

static PREVIOUS_HOOK: Mutex<Option<Arc<PanicHook>>> = Mutex::new(None);

thread_local! {
    static PANIC_SITE: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

/// Chain a recording hook in front of the current panic hook
///
/// Returns false if the hook was already installed.
pub fn install_panic_hook() -> bool {
    let mut previous = PREVIOUS_HOOK.lock();
    if previous.is_some() {
        return false;
    }

    let chained: Arc<PanicHook> = Arc::new(panic::take_hook());
    *previous = Some(Arc::clone(&chained));

    panic::set_hook(Box::new(move |info| {
        record_panic_site(info);
        chained(info);
    }));
    debug!("Panic hook installed");
    true
}

/// Put back the hook that was active before [`install_panic_hook`]
///
/// Returns false if the hook was not installed.
pub fn restore_panic_hook() -> bool {
    let mut previous = PREVIOUS_HOOK.lock();
    match previous.take() {
        Some(chained) => {
            panic::set_hook(Box::new(move |info| chained(info)));
            debug!("Panic hook restored");
            true
        }
        None => false,
    }
}

pub fn is_panic_hook_installed() -> bool {
    PREVIOUS_HOOK.lock().is_some()
}

fn record_panic_site(info: &PanicHookInfo<'_>) {
    let (file, line) = info
        .location()
        .map(|loc| (loc.file().to_string(), loc.line()))
        .unwrap_or_default();

    let site = PanicSite {
        message: panic_message(info.payload()),
        file,
        line,
        frames: parse_backtrace(&Backtrace::force_capture().to_string()),
    };

    // A panic while the slot is borrowed must not recurse
    let _ = PANIC_SITE.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(site);
        }
    });
}

/// Take the site recorded on this thread if it belongs to `message`
pub(crate) fn take_panic_site(message: &str) -> Option<PanicSite> {
    PANIC_SITE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut s| s.take()))
        .ok()
        .flatten()
        .filter(|site| site.message == message)
}

/// Text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Report a recovered panic to the registered orchestrator
///
/// Returns whether the event was queued.
pub fn report_panic(payload: &(dyn Any + Send)) -> bool {
    let message = panic_message(payload);
    let site = take_panic_site(&message);

    match registry::get() {
        Some(orchestrator) => orchestrator.capture_fault(message, site),
        None => {
            warn!("No orchestrator registered, fault not captured: {}", message);
            false
        }
    }
}

/// Report a non-panic fault (e.g. an unrecoverable error) at the current call site
pub fn report_fault(message: impl Into<String>) -> bool {
    let message = message.into();
    match registry::get() {
        Some(orchestrator) => orchestrator.capture_fault(message, None),
        None => {
            warn!("No orchestrator registered, fault not captured: {}", message);
            false
        }
    }
}

/// Run `f`; if it panics, capture the fault and resume the panic
pub fn capture_rethrow<F, R>(f: F) -> R
where
    F: FnOnce() -> R + UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(value) => value,
        Err(payload) => {
            report_panic(payload.as_ref());
            panic::resume_unwind(payload)
        }
    }
}

/// Run `f`; if it panics, capture the fault and return `None`
pub fn capture_suppress<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(value) => Some(value),
        Err(payload) => {
            report_panic(payload.as_ref());
            None
        }
    }
}

/// Wrap `f` so a panic is captured and then propagated
pub fn wrap<F, R>(f: F) -> impl FnOnce() -> R
where
    F: FnOnce() -> R + UnwindSafe,
{
    move || capture_rethrow(f)
}

/// Wrap `f` so a panic is captured and swallowed
pub fn wrap_with_recovery<F, R>(f: F) -> impl FnOnce() -> Option<R>
where
    F: FnOnce() -> R + UnwindSafe,
{
    move || capture_suppress(f)
}

/// Spawn a tokio task whose panic is captured instead of poisoning the join handle
pub fn spawn_guarded<Fut>(future: Fut) -> tokio::task::JoinHandle<Option<Fut::Output>>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(value) => Some(value),
            Err(payload) => {
                report_panic(payload.as_ref());
                None
            }
        }
    })
}

/// Spawn an OS thread whose panic is captured and swallowed
pub fn spawn_thread_guarded<F, R>(f: F) -> std::thread::JoinHandle<Option<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    std::thread::spawn(move || capture_suppress(AssertUnwindSafe(f)))
}
