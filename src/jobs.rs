//! Job definitions for the pipeline
//!
//! Four queues share one broker. Each queue has a fixed priority and
//! retry budget; payloads are serialized as JSON in the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four work queues, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Inbound message handling, the latency-sensitive path
    Message,
    /// Scheduled reminders and follow-ups
    Automation,
    /// Bulk outbound sends
    Campaign,
    /// Forgotten-customer scans
    Recovery,
}

impl QueueKind {
    pub const ALL: [Self; 4] = [Self::Message, Self::Automation, Self::Campaign, Self::Recovery];

    /// Lower number claims first when queues contend
    #[must_use]
    pub const fn priority(self) -> i32 {
        match self {
            Self::Message => 1,
            Self::Automation => 3,
            Self::Campaign => 5,
            Self::Recovery => 7,
        }
    }

    /// Total delivery attempts before a job is dead-lettered
    #[must_use]
    pub const fn max_attempts(self) -> u32 {
        match self {
            Self::Message => 3,
            Self::Automation | Self::Campaign | Self::Recovery => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Automation => "automation",
            Self::Campaign => "campaign",
            Self::Recovery => "recovery",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "automation" => Some(Self::Automation),
            "campaign" => Some(Self::Campaign),
            "recovery" => Some(Self::Recovery),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound message to process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJob {
    pub instance_id: String,
    /// Protocol-assigned id of the originating message
    pub message_id: String,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// One bulk campaign to deliver sequentially
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJob {
    pub campaign_id: String,
    pub instance_id: String,
    pub recipients: Vec<String>,
    /// Message body with `{{key}}` placeholders
    pub template: String,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
}

/// What kind of automation fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationKind {
    Reminder,
    Other,
}

/// A scheduled reminder or follow-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationJob {
    pub automation_id: String,
    pub kind: AutomationKind,
    pub instance_id: String,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    /// Message body with `{{key}}` placeholders
    pub content: String,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
}

/// Trigger a forgotten-customer scan for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryScanJob {
    pub instance_id: String,
    /// Manual re-scans bypass the once-per-instance check
    #[serde(default)]
    pub force: bool,
}

/// A job as stored in the broker
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: QueueKind,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Build a new job from a serializable payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn new<P: Serialize>(queue: QueueKind, tenant_id: &str, payload: &P) -> crate::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            queue,
            tenant_id: tenant_id.to_owned(),
            payload: serde_json::to_value(payload)?,
            attempts: 0,
            max_attempts: queue.max_attempts(),
            enqueued_at: Utc::now(),
        })
    }

    /// Deserialize the payload into its concrete job type
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not match the requested shape
    pub fn parse<P: for<'de> Deserialize<'de>>(&self) -> crate::Result<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// How a handler failed. Retryable failures reschedule with backoff until
/// attempts run out; fatal failures dead-letter immediately.
#[derive(Debug)]
pub enum JobError {
    Retryable(crate::Error),
    Fatal(crate::Error),
}

impl JobError {
    /// Classify an error by its own retryability
    #[must_use]
    pub const fn from_error(err: crate::Error) -> Self {
        if err.is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err)
        }
    }

    #[must_use]
    pub const fn inner(&self) -> &crate::Error {
        match self {
            Self::Retryable(e) | Self::Fatal(e) => e,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(e) => write!(f, "retryable: {e}"),
            Self::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Handler result
pub type JobOutcome = std::result::Result<(), JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_priorities_are_ordered() {
        assert!(QueueKind::Message.priority() < QueueKind::Automation.priority());
        assert!(QueueKind::Automation.priority() < QueueKind::Campaign.priority());
        assert!(QueueKind::Campaign.priority() < QueueKind::Recovery.priority());
    }

    #[test]
    fn job_payload_round_trips() {
        let payload = MessageJob {
            instance_id: "inst-1".to_owned(),
            message_id: "wamid-1".to_owned(),
            contact_phone: "5511988887777".to_owned(),
            contact_name: None,
            content: "oi".to_owned(),
            received_at: Utc::now(),
        };
        let job = Job::new(QueueKind::Message, "org-1", &payload).unwrap();
        assert_eq!(job.max_attempts, 3);

        let parsed: MessageJob = job.parse().unwrap();
        assert_eq!(parsed.content, "oi");
    }

    #[test]
    fn job_error_classifies_by_retryability() {
        let retryable = JobError::from_error(crate::Error::Transport("socket closed".to_owned()));
        assert!(matches!(retryable, JobError::Retryable(_)));

        let fatal = JobError::from_error(crate::Error::Validation("bad phone".to_owned()));
        assert!(matches!(fatal, JobError::Fatal(_)));
    }
}
