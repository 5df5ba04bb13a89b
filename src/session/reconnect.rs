//! Reconnection policy
//!
//! Backoff starts at five seconds and grows by half each attempt, capped
//! at a minute. Two disconnect reasons are terminal: a logout means the
//! credentials are dead, and a replacement means another process owns the
//! session now.

use std::time::Duration;

/// Why a transport connection dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Credentials were invalidated on the remote side
    LoggedOut,
    /// Another connection took over the session
    ConnectionReplaced,
    ConnectionClosed,
    TimedOut,
    Other(String),
}

impl DisconnectReason {
    /// Terminal reasons never trigger a reconnect
    #[must_use]
    pub const fn should_reconnect(&self) -> bool {
        !matches!(self, Self::LoggedOut | Self::ConnectionReplaced)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::ConnectionReplaced => "connection_replaced",
            Self::ConnectionClosed => "connection_closed",
            Self::TimedOut => "timed_out",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a hard attempt ceiling
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            factor: 1.5,
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), or `None` once the
    /// attempt budget is spent
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let scaled = self.base.as_secs_f64() * self.factor.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
        Some(Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs_f64(7.5)));
        // deep attempts hit the cap
        assert_eq!(policy.delay(10), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay(11), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn terminal_reasons_do_not_reconnect() {
        assert!(!DisconnectReason::LoggedOut.should_reconnect());
        assert!(!DisconnectReason::ConnectionReplaced.should_reconnect());
        assert!(DisconnectReason::ConnectionClosed.should_reconnect());
        assert!(DisconnectReason::TimedOut.should_reconnect());
        assert!(DisconnectReason::Other("weird".to_owned()).should_reconnect());
    }
}
