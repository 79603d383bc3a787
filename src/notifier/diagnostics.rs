// ABOUTME: Counters and a bounded fault trace for a running notifier
// ABOUTME: Snapshots can be taken from any task without pausing the loop

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{FaultCategory, NotifierError, Severity};

/// Most recent faults kept in the trace.
pub const TRACE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub at: DateTime<Utc>,
    pub category: FaultCategory,
    pub severity: Severity,
    pub message: String,
}

/// Point-in-time copy of a notifier's counters and fault trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticsSnapshot {
    pub envelopes_received: u64,
    pub events_dispatched: u64,
    pub heartbeats: u64,
    pub protocol_faults: u64,
    pub conversion_faults: u64,
    pub transport_faults: u64,
    pub setup_faults: u64,
    pub reconnect_attempts: u64,
    /// Oldest first
    pub recent_faults: Vec<FaultRecord>,
}

impl DiagnosticsSnapshot {
    pub fn total_faults(&self) -> u64 {
        self.protocol_faults + self.conversion_faults + self.transport_faults + self.setup_faults
    }
}

#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    envelopes_received: AtomicU64,
    events_dispatched: AtomicU64,
    heartbeats: AtomicU64,
    protocol_faults: AtomicU64,
    conversion_faults: AtomicU64,
    transport_faults: AtomicU64,
    setup_faults: AtomicU64,
    reconnect_attempts: AtomicU64,
    trace: Mutex<VecDeque<FaultRecord>>,
}

impl Diagnostics {
    pub(crate) fn envelope_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, error: &NotifierError, severity: Severity) {
        let category = error.category();
        let counter = match category {
            FaultCategory::Protocol => &self.protocol_faults,
            FaultCategory::Conversion => &self.conversion_faults,
            FaultCategory::Transport => &self.transport_faults,
            FaultCategory::Setup => &self.setup_faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut trace = self.trace.lock().unwrap_or_else(|p| p.into_inner());
        if trace.len() == TRACE_CAPACITY {
            trace.pop_front();
        }
        trace.push_back(FaultRecord {
            at: Utc::now(),
            category,
            severity,
            message: error.to_string(),
        });
    }

    pub(crate) fn snapshot(&self) -> DiagnosticsSnapshot {
        let recent_faults = self
            .trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        DiagnosticsSnapshot {
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            protocol_faults: self.protocol_faults.load(Ordering::Relaxed),
            conversion_faults: self.conversion_faults.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            setup_faults: self.setup_faults.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            recent_faults,
        }
    }
}
