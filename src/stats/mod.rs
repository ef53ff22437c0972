use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConnectionAttempts,
    ConnectionsCreated,
    ConnectionsFailed,
    MessagesSent,
    MessagesReceived,
    Reconnections,
    Errors,
}

/// Run-wide counters shared by every session and driver.
///
/// Each field is its own atomic, so increments from any number of tasks are
/// never lost. A snapshot reads the fields one by one: every field reflects
/// all increments completed before the read, but the fields are not read
/// under a common lock.
#[derive(Debug, Default)]
pub struct StressStats {
    connection_attempts: AtomicU64,
    connections_created: AtomicU64,
    connections_failed: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnections: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connection_attempts: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnections: u64,
    pub errors: u64,
}

impl StressStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, delta: u64) {
        self.cell(counter).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connection_attempts: self.get(Counter::ConnectionAttempts),
            connections_created: self.get(Counter::ConnectionsCreated),
            connections_failed: self.get(Counter::ConnectionsFailed),
            messages_sent: self.get(Counter::MessagesSent),
            messages_received: self.get(Counter::MessagesReceived),
            reconnections: self.get(Counter::Reconnections),
            errors: self.get(Counter::Errors),
        }
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ConnectionAttempts => &self.connection_attempts,
            Counter::ConnectionsCreated => &self.connections_created,
            Counter::ConnectionsFailed => &self.connections_failed,
            Counter::MessagesSent => &self.messages_sent,
            Counter::MessagesReceived => &self.messages_received,
            Counter::Reconnections => &self.reconnections,
            Counter::Errors => &self.errors,
        }
    }
}

impl StatsSnapshot {
    /// `(created - failed) / created`, or `None` before any connection was made.
    pub fn connection_success_rate(&self) -> Option<f64> {
        if self.connections_created == 0 {
            return None;
        }
        let succeeded = self.connections_created.saturating_sub(self.connections_failed);
        Some(succeeded as f64 / self.connections_created as f64)
    }

    /// `received / sent`, or `None` when nothing was sent.
    pub fn delivery_rate(&self) -> Option<f64> {
        if self.messages_sent == 0 {
            return None;
        }
        Some(self.messages_received as f64 / self.messages_sent as f64)
    }
}

pub type SharedStats = Arc<StressStats>;
