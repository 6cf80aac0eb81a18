//! Process-wide orchestrator registry
//!
//! Capture entry points report to whichever orchestrator is registered here.
//! Registering replaces the previous instance (last writer wins).

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::orchestrator::Orchestrator;

static ACTIVE: RwLock<Option<Arc<Orchestrator>>> = RwLock::new(None);

/// Register `orchestrator`, returning the one it replaced
pub fn set(orchestrator: Arc<Orchestrator>) -> Option<Arc<Orchestrator>> {
    let previous = ACTIVE.write().replace(orchestrator);
    if previous.is_some() {
        info!("Replaced globally registered orchestrator");
    }
    previous
}

pub fn get() -> Option<Arc<Orchestrator>> {
    ACTIVE.read().clone()
}

pub fn clear() -> Option<Arc<Orchestrator>> {
    ACTIVE.write().take()
}

/// Clear the registry only if `orchestrator` is the registered instance
pub fn clear_if(orchestrator: &Arc<Orchestrator>) -> bool {
    let mut active = ACTIVE.write();
    match active.as_ref() {
        Some(current) if Arc::ptr_eq(current, orchestrator) => {
            *active = None;
            true
        }
        _ => false,
    }
}

pub fn is_installed() -> bool {
    ACTIVE.read().is_some()
}
