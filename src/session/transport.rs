//! Chat-protocol transport seam
//!
//! The registry never speaks the wire protocol itself; a [`Transport`]
//! implementation does, and reports lifecycle changes back as
//! [`TransportEvent`]s.

use async_trait::async_trait;

use super::reconnect::DisconnectReason;
use crate::Result;

/// Lifecycle and traffic events surfaced by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        instance_id: String,
        phone_number: Option<String>,
        /// Updated credential blob to persist, when the protocol rotated it
        creds: Option<Vec<u8>>,
    },
    Disconnected {
        instance_id: String,
        reason: DisconnectReason,
    },
    MessageReceived {
        instance_id: String,
        /// Protocol-assigned id of the inbound message
        message_id: String,
        from_phone: String,
        from_name: Option<String>,
        content: String,
        received_at: chrono::DateTime<chrono::Utc>,
    },
}

/// Driver for one chat protocol
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for an instance, resuming from saved credentials
    /// when available
    async fn connect(&self, instance_id: &str, creds: Option<&[u8]>) -> Result<()>;

    /// Request a pairing code bound to the given phone number
    async fn request_pairing_code(&self, instance_id: &str, phone: &str) -> Result<String>;

    /// Send a plain text message, returning the transport message id
    async fn send_text(&self, instance_id: &str, to: &str, content: &str) -> Result<String>;

    /// Tear down the connection for an instance
    async fn disconnect(&self, instance_id: &str) -> Result<()>;
}

#[cfg(test)]
pub use mock::MockTransport;
