//! Connection health counters

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::TransportError;

/// Counters shared between the connection task, the device task and the
/// diagnostics endpoint.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    connects: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    messages: AtomicU64,
    parse_errors: AtomicU64,
    rejected_fields: AtomicU64,
    last_error: Mutex<Option<String>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub connects: u64,
    pub reconnects: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub messages: u64,
    pub parse_errors: u64,
    pub rejected_fields: u64,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *lock(&self.connected_since) = Some(Utc::now());
    }

    pub fn on_disconnected(&self, reason: Option<&TransportError>) {
        *lock(&self.connected_since) = None;
        if let Some(err) = reason {
            *lock(&self.last_error) = Some(err.to_string());
        }
    }

    pub fn on_failure(&self, err: &TransportError) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_error) = Some(err.to_string());
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn on_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_message_at) = Some(Utc::now());
    }

    pub fn on_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_rejected_fields(&self, count: usize) {
        self.rejected_fields.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let connects = self.connects.load(Ordering::Relaxed);
        let connected_since = *lock(&self.connected_since);
        HealthSnapshot {
            connects,
            reconnects: connects.saturating_sub(1),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            rejected_fields: self.rejected_fields.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
            connected_since,
            last_message_at: *lock(&self.last_message_at),
            uptime_secs: connected_since.map(|since| (Utc::now() - since).num_seconds()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let health = ConnectionHealth::new();
        assert_eq!(health.on_failure(&TransportError::Closed), 1);
        assert_eq!(health.on_failure(&TransportError::HandshakeTimeout), 2);

        health.on_connected();
        health.on_message();
        health.on_parse_error();
        health.on_rejected_fields(2);
        health.on_connected();

        let snapshot = health.snapshot();
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.messages, 1);
        assert_eq!(snapshot.parse_errors, 1);
        assert_eq!(snapshot.rejected_fields, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("handshake timed out"));
        assert!(snapshot.connected_since.is_some());
    }

    #[test]
    fn test_disconnect_clears_uptime() {
        let health = ConnectionHealth::new();
        health.on_connected();
        health.on_disconnected(Some(&TransportError::Stale));

        let snapshot = health.snapshot();
        assert!(snapshot.connected_since.is_none());
        assert!(snapshot.uptime_secs.is_none());
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("no frame received within liveness window")
        );
    }
}
