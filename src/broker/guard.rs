//! Broker health guard
//!
//! Counts consecutive broker failures and trips open at a threshold.
//! While open, enqueues are rejected up front instead of piling onto a
//! struggling store. A single successful operation closes it again.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Observable guard state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Closed,
    Open,
}

const FAILURE_THRESHOLD: u32 = 3;

/// Consecutive-failure circuit for the broker
#[derive(Debug, Default)]
pub struct BrokerGuard {
    consecutive_failures: AtomicU32,
}

impl BrokerGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Record a successful broker operation, closing the guard
    pub fn record_success(&self) {
        let prior = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if prior >= FAILURE_THRESHOLD {
            tracing::info!("broker guard closed after successful operation");
        }
    }

    /// Record a failed broker operation
    pub fn record_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count == FAILURE_THRESHOLD {
            tracing::warn!(failures = count, "broker guard opened");
        }
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        if self.consecutive_failures.load(Ordering::SeqCst) >= FAILURE_THRESHOLD {
            GuardState::Open
        } else {
            GuardState::Closed
        }
    }

    /// Whether new work may be accepted
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state() == GuardState::Closed
    }
}
