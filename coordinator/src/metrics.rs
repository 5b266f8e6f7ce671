//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Coordinator metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Transactions begun.
    pub transactions_begun: AtomicU64,
    /// Transactions committed.
    pub transactions_committed: AtomicU64,
    /// Transactions aborted, for any reason.
    pub transactions_aborted: AtomicU64,
    /// Transactions in progress.
    pub transactions_active: AtomicU64,
    /// Lock requests refused because they would deadlock.
    pub deadlocks_detected: AtomicU64,
    /// Locks granted on request.
    pub locks_granted: AtomicU64,
    /// Lock requests that had to wait.
    pub locks_waited: AtomicU64,
    /// Waiting transactions granted a lock on release.
    pub locks_promoted: AtomicU64,
    /// Connected client sessions.
    pub clients_active: AtomicU64,
    /// Connected participants.
    pub participants_active: AtomicU64,
    /// Lines received from clients and participants.
    pub messages_received: AtomicU64,
    /// Lines sent to clients and participants.
    pub messages_sent: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_begun(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transaction_aborted(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn deadlock_detected(&self) {
        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_granted(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_waited(&self) {
        self.locks_waited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn locks_promoted(&self, count: u64) {
        self.locks_promoted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set active participants count.
    pub fn set_participants_active(&self, count: u64) {
        self.participants_active.store(count, Ordering::Relaxed);
    }

    pub fn participant_disconnected(&self) {
        self.participants_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            transactions_active: self.transactions_active.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            locks_waited: self.locks_waited.load(Ordering::Relaxed),
            locks_promoted: self.locks_promoted.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            participants_active: self.participants_active.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, &str, &str, u64); 12] = [
            ("transactions_begun", "counter", "Transactions begun", s.transactions_begun),
            ("transactions_committed", "counter", "Transactions committed", s.transactions_committed),
            ("transactions_aborted", "counter", "Transactions aborted", s.transactions_aborted),
            ("transactions_active", "gauge", "Transactions in progress", s.transactions_active),
            ("deadlocks_detected", "counter", "Lock requests refused as deadlocks", s.deadlocks_detected),
            ("locks_granted", "counter", "Locks granted on request", s.locks_granted),
            ("locks_waited", "counter", "Lock requests that waited", s.locks_waited),
            ("locks_promoted", "counter", "Waiters granted a lock on release", s.locks_promoted),
            ("clients_active", "gauge", "Connected clients", s.clients_active),
            ("participants_active", "gauge", "Connected participants", s.participants_active),
            ("messages_received", "counter", "Lines received", s.messages_received),
            ("messages_sent", "counter", "Lines sent", s.messages_sent),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in rows {
            out.push_str(&format!(
                "# HELP bankcoord_{name} {help}\n# TYPE bankcoord_{name} {kind}\nbankcoord_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_active: u64,
    pub deadlocks_detected: u64,
    pub locks_granted: u64,
    pub locks_waited: u64,
    pub locks_promoted: u64,
    pub clients_active: u64,
    pub participants_active: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

impl MetricsSnapshot {
    /// Render as a single JSON object for log lines.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
