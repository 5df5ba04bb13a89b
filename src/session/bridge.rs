//! HTTP protocol-bridge transport
//!
//! The chat protocol itself runs in an external bridge process. This
//! transport drives it over HTTP; lifecycle events and inbound traffic
//! come back through the gateway's webhook endpoint.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::transport::Transport;
use crate::config::BridgeConfig;
use crate::{Error, Result};

/// Transport over an external protocol bridge
pub struct BridgeTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl BridgeTransport {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("bridge unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                // The bridge no longer accepts this session; re-pairing is
                // the only way forward
                return Err(Error::AuthInvalidated(format!("bridge refused: {body}")));
            }
            return Err(Error::Transport(format!("bridge error: {status} - {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("bridge response malformed: {e}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest<'a> {
    /// Base64-encoded credential blob from a prior session
    #[serde(skip_serializing_if = "Option::is_none")]
    creds: Option<String>,
    instance_id: &'a str,
}

#[derive(Deserialize)]
struct Ack {
    #[allow(dead_code)]
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PairingRequest<'a> {
    phone_number: &'a str,
}

#[derive(Deserialize)]
struct PairingCode {
    code: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAck {
    message_id: String,
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, instance_id: &str, creds: Option<&[u8]>) -> Result<()> {
        let _: Ack = self
            .post(
                &format!("/instances/{instance_id}/connect"),
                &ConnectRequest {
                    creds: creds.map(|c| base64::engine::general_purpose::STANDARD.encode(c)),
                    instance_id,
                },
            )
            .await?;
        Ok(())
    }

    async fn request_pairing_code(&self, instance_id: &str, phone: &str) -> Result<String> {
        let response: PairingCode = self
            .post(
                &format!("/instances/{instance_id}/pairing-code"),
                &PairingRequest {
                    phone_number: phone,
                },
            )
            .await?;
        Ok(response.code)
    }

    async fn send_text(&self, instance_id: &str, to: &str, content: &str) -> Result<String> {
        let ack: SendAck = self
            .post(
                &format!("/instances/{instance_id}/send"),
                &SendRequest { to, content },
            )
            .await?;
        tracing::debug!(instance_id, to, message_id = %ack.message_id, "bridge message sent");
        Ok(ack.message_id)
    }

    async fn disconnect(&self, instance_id: &str) -> Result<()> {
        let _: Ack = self
            .post(
                &format!("/instances/{instance_id}/disconnect"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }
}

/// Webhook payload the bridge posts back to the gateway
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeWebhook {
    Connected {
        instance_id: String,
        phone_number: Option<String>,
        /// Base64-encoded credential blob
        creds: Option<String>,
    },
    Disconnected {
        instance_id: String,
        reason: String,
    },
    Message {
        instance_id: String,
        message_id: String,
        from_phone: String,
        from_name: Option<String>,
        content: String,
        /// When the protocol timestamped the message; defaults to receipt
        /// time when the bridge omits it
        #[serde(default = "chrono::Utc::now")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl BridgeWebhook {
    /// Translate a webhook payload into a transport event
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the credential blob is not valid
    /// base64
    pub fn into_event(self) -> Result<super::TransportEvent> {
        use super::reconnect::DisconnectReason;
        use super::TransportEvent;

        Ok(match self {
            Self::Connected {
                instance_id,
                phone_number,
                creds,
            } => TransportEvent::Connected {
                instance_id,
                phone_number,
                creds: creds
                    .map(|c| {
                        base64::engine::general_purpose::STANDARD
                            .decode(c)
                            .map_err(|e| Error::Validation(format!("bad creds encoding: {e}")))
                    })
                    .transpose()?,
            },
            Self::Disconnected {
                instance_id,
                reason,
            } => TransportEvent::Disconnected {
                instance_id,
                reason: match reason.as_str() {
                    "logged_out" => DisconnectReason::LoggedOut,
                    "connection_replaced" => DisconnectReason::ConnectionReplaced,
                    "connection_closed" => DisconnectReason::ConnectionClosed,
                    "timed_out" => DisconnectReason::TimedOut,
                    other => DisconnectReason::Other(other.to_owned()),
                },
            },
            Self::Message {
                instance_id,
                message_id,
                from_phone,
                from_name,
                content,
                timestamp,
            } => TransportEvent::MessageReceived {
                instance_id,
                message_id,
                from_phone,
                from_name,
                content,
                received_at: timestamp,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransportEvent;

    #[test]
    fn webhook_maps_to_transport_events() {
        let payload: BridgeWebhook = serde_json::from_value(serde_json::json!({
            "type": "disconnected",
            "instance_id": "inst-1",
            "reason": "logged_out",
        }))
        .unwrap();

        let event = payload.into_event().unwrap();
        assert!(matches!(
            event,
            TransportEvent::Disconnected {
                reason: crate::session::DisconnectReason::LoggedOut,
                ..
            }
        ));
    }

    #[test]
    fn message_webhook_carries_id_and_timestamp() {
        let payload: BridgeWebhook = serde_json::from_value(serde_json::json!({
            "type": "message",
            "instance_id": "inst-1",
            "message_id": "wamid-123",
            "from_phone": "5511988887777",
            "from_name": "Ana",
            "content": "oi",
            "timestamp": "2026-08-01T12:00:00Z",
        }))
        .unwrap();

        match payload.into_event().unwrap() {
            TransportEvent::MessageReceived {
                message_id,
                received_at,
                ..
            } => {
                assert_eq!(message_id, "wamid-123");
                assert_eq!(received_at.to_rfc3339(), "2026-08-01T12:00:00+00:00");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // a bridge that omits the timestamp still produces one
        let payload: BridgeWebhook = serde_json::from_value(serde_json::json!({
            "type": "message",
            "instance_id": "inst-1",
            "message_id": "wamid-124",
            "from_phone": "5511988887777",
            "content": "oi",
        }))
        .unwrap();
        assert!(matches!(
            payload.into_event().unwrap(),
            TransportEvent::MessageReceived { .. }
        ));
    }

    #[test]
    fn connected_webhook_decodes_creds() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"secret");
        let payload: BridgeWebhook = serde_json::from_value(serde_json::json!({
            "type": "connected",
            "instance_id": "inst-1",
            "phone_number": "5511999990000",
            "creds": encoded,
        }))
        .unwrap();

        match payload.into_event().unwrap() {
            TransportEvent::Connected { creds, .. } => {
                assert_eq!(creds.unwrap(), b"secret");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
