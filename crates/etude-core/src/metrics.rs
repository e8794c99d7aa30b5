// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

/// Server-wide counters, shared by the reactor and the workers.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    /// Connections turned away with the busy message.
    pub rejected: AtomicUsize,
    /// Connections dropped because the worker queue was full.
    pub shed: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub req_count: usize,
    pub active_conns: usize,
    pub bytes_sent: usize,
    pub rejected: usize,
    pub shed: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            shed: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            req_count: self.req_count.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            requests = s.req_count,
            connections = s.active_conns,
            bytes_sent = s.bytes_sent,
            rejected = s.rejected,
            shed = s.shed,
            "metrics"
        );
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = ServerMetrics::new();
        m.inc_req();
        m.inc_req();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.add_bytes(100);
        m.add_bytes(23);
        m.inc_rejected();
        m.inc_shed();

        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                req_count: 2,
                active_conns: 1,
                bytes_sent: 123,
                rejected: 1,
                shed: 1,
            }
        );
    }
}
