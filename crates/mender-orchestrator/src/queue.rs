//! Bounded fault event queue with oldest-drop overflow
//!
//! Enqueue never blocks. The fast path is a single lock-free push; only a full
//! queue takes the overflow lock to evict the oldest event.

use crossbeam_queue::ArrayQueue;
use mender_core::FaultEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub struct FaultQueue {
    events: ArrayQueue<FaultEvent>,
    overflow_lock: Mutex<()>,
    dropped: AtomicU64,
    available: Notify,
}

impl FaultQueue {
    /// Create a queue holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            events: ArrayQueue::new(capacity.max(1)),
            overflow_lock: Mutex::new(()),
            dropped: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    /// Offer an event, evicting the oldest one if the queue is full
    ///
    /// Returns false only when the event itself could not be stored.
    pub fn enqueue(&self, event: FaultEvent) -> bool {
        let event = match self.events.push(event) {
            Ok(()) => {
                self.available.notify_one();
                return true;
            }
            Err(event) => event,
        };

        let _guard = self.overflow_lock.lock();

        if let Some(oldest) = self.events.pop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Event queue full, dropped oldest event {} to make room for {}",
                oldest.id(),
                event.id()
            );
        }

        match self.events.push(event) {
            Ok(()) => {
                self.available.notify_one();
                true
            }
            Err(event) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Event queue still full after eviction, dropped event {}",
                    event.id()
                );
                false
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<FaultEvent> {
        self.events.pop()
    }

    /// Wait for the next event
    ///
    /// Returns `None` once `cancel` fires, leaving any remaining events queued.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<FaultEvent> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(event) = self.events.pop() {
                return Some(event);
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // An event pushed between the pop above and enable() left a permit
            // or is visible now.
            if let Some(event) = self.events.pop() {
                return Some(event);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Events discarded because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
