// warp_client/src/metrics.rs
// Per-session traffic and dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters owned by a session. Updated from the listener task and
/// the dispatch path; read via `snapshot`.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    callbacks_invoked: AtomicU64,
    callback_failures: AtomicU64,
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub callbacks_invoked: u64,
    pub callback_failures: u64,
}

impl SessionMetrics {
    pub(crate) fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, invoked: usize, failed: usize) {
        self.callbacks_invoked
            .fetch_add(invoked as u64, Ordering::Relaxed);
        self.callback_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}
