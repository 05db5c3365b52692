//! # Stage: Ingestion Bus
//!
//! ## Responsibility
//! Fan-in of readings from every device loop into the single sink worker.
//! Bounded FIFO with capacity `batch_size · 4`.
//!
//! ## Guarantees
//! - Non-blocking publish: `publish` never suspends; on a full queue the
//!   oldest pending reading is dropped and the drop counter increments
//! - FIFO per producer: each loop publishes in order, so per-channel order
//!   survives end to end; cross-device order is not guaranteed
//! - Graceful close: after `close`, the consumer drains what is queued and
//!   then sees `None`
//!
//! ## NOT Responsible For
//! - Batching and flush policy (the sink)
//! - Metrics export (the drop counter is read by the metrics layer)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::reading::Reading;

struct BusState {
    queue: Mutex<VecDeque<Reading>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Producer handle. Clone freely — all clones feed the same queue.
#[derive(Clone)]
pub struct IngestionBus {
    inner: Arc<BusState>,
}

/// The single consumer side, held by the sink worker.
pub struct BusReceiver {
    inner: Arc<BusState>,
}

/// Create a bus with the given capacity (at least 1).
pub fn channel(capacity: usize) -> (IngestionBus, BusReceiver) {
    let inner = Arc::new(BusState {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        IngestionBus { inner: Arc::clone(&inner) },
        BusReceiver { inner },
    )
}

impl IngestionBus {
    /// Enqueue a reading without blocking. Returns `false` when the queue was
    /// full and the oldest pending reading had to be dropped to make room.
    pub fn publish(&self, reading: Reading) -> bool {
        let mut accepted_cleanly = true;
        {
            let mut queue = self.inner.queue.lock().expect("bus lock poisoned");
            if queue.len() == self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                accepted_cleanly = false;
            }
            queue.push_back(reading);
        }
        self.inner.notify.notify_one();
        accepted_cleanly
    }

    /// Total readings dropped to back-pressure since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.inner.queue.lock().expect("bus lock poisoned").len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Close the bus. Queued readings remain receivable; afterwards the
    /// consumer sees `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

impl BusReceiver {
    /// Receive the next reading, waiting if the queue is empty. Returns
    /// `None` once the bus is closed and fully drained.
    pub async fn recv(&self) -> Option<Reading> {
        loop {
            // register interest before checking, so a publish between the
            // check and the await cannot be missed
            let notified = self.inner.notify.notified();
            if let Some(reading) = self.try_recv() {
                return Some(reading);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                // re-check: a final publish may have raced the close
                return self.try_recv();
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Reading> {
        self.inner.queue.lock().expect("bus lock poisoned").pop_front()
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().expect("bus lock poisoned").len()
    }
}
