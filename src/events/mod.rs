//! Tenant event fan-out
//!
//! Every lifecycle event carries a tenant id and is delivered only to
//! subscribers of that tenant. Emission is best-effort; a tenant with no
//! listeners drops events silently.
//!
//! Components receive an [`EventSink`] at construction instead of reaching
//! for a process-wide publisher, so tests can capture emissions directly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per tenant channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 256;

/// An event scoped to one tenant
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unique event ID (UUID v4)
    pub id: String,
    /// Event type (e.g., `"connection:update"`)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tenant the event belongs to
    pub tenant_id: String,
    /// Arbitrary event payload
    pub data: serde_json::Value,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl Event {
    /// Create a new event with auto-generated `id` and `timestamp`
    #[must_use]
    pub fn new(event_type: &str, tenant_id: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Destination for emitted events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Shared sink handle
pub type SharedSink = Arc<dyn EventSink>;

/// In-process fan-out hub with one broadcast channel per tenant
#[derive(Default)]
pub struct EventHub {
    rooms: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a tenant's event stream, creating the room on demand
    #[must_use]
    pub fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<Event> {
        let mut rooms = self.rooms.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        rooms
            .entry(tenant_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: Event) {
        let sender = {
            let rooms = self.rooms.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            rooms.get(&event.tenant_id).cloned()
        };
        if let Some(sender) = sender {
            // Err means no live subscribers, which is fine
            let _ = sender.send(event);
        } else {
            tracing::trace!(
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                "event dropped, no subscribers"
            );
        }
    }
}

/// Build a `connection:update` event covering every status transition
#[must_use]
pub fn build_connection_update_event(
    tenant_id: &str,
    instance_id: &str,
    status: &str,
    phone: Option<&str>,
    reason: Option<&str>,
) -> Event {
    Event::new(
        "connection:update",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "status": status,
            "phoneNumber": phone,
            "reason": reason,
        }),
    )
}

/// Build a `pairing:code` event
#[must_use]
pub fn build_pairing_code_event(tenant_id: &str, instance_id: &str, code: &str) -> Event {
    Event::new(
        "pairing:code",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "code": code,
        }),
    )
}

/// Build a `message:received` event
#[must_use]
pub fn build_message_received_event(
    tenant_id: &str,
    instance_id: &str,
    message_id: &str,
    contact_phone: &str,
    content: &str,
) -> Event {
    Event::new(
        "message:received",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "messageId": message_id,
            "contactPhone": contact_phone,
            "content": content,
        }),
    )
}

/// Build a `message:sent` event
#[must_use]
pub fn build_message_sent_event(
    tenant_id: &str,
    instance_id: &str,
    contact_phone: &str,
    message_id: &str,
    sent_by_ai: bool,
) -> Event {
    Event::new(
        "message:sent",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "contactPhone": contact_phone,
            "messageId": message_id,
            "sentByAi": sent_by_ai,
        }),
    )
}

/// Build a `campaign:progress` event
#[must_use]
pub fn build_campaign_progress_event(
    tenant_id: &str,
    campaign_id: &str,
    sent: u32,
    failed: u32,
    total: u32,
    percentage: u32,
) -> Event {
    Event::new(
        "campaign:progress",
        tenant_id,
        serde_json::json!({
            "campaignId": campaign_id,
            "sent": sent,
            "failed": failed,
            "total": total,
            "percentage": percentage,
        }),
    )
}

/// Build a `campaign:finished` event
#[must_use]
pub fn build_campaign_finished_event(
    tenant_id: &str,
    campaign_id: &str,
    sent: u32,
    failed: u32,
) -> Event {
    Event::new(
        "campaign:finished",
        tenant_id,
        serde_json::json!({
            "campaignId": campaign_id,
            "sent": sent,
            "failed": failed,
        }),
    )
}

/// Build a `recovery:started` event
#[must_use]
pub fn build_recovery_started_event(tenant_id: &str, instance_id: &str, total: u32) -> Event {
    Event::new(
        "recovery:started",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "total": total,
        }),
    )
}

/// Build a `recovery:progress` event
#[must_use]
pub fn build_recovery_progress_event(
    tenant_id: &str,
    instance_id: &str,
    current: u32,
    total: u32,
    percentage: u32,
    eta_seconds: u64,
) -> Event {
    Event::new(
        "recovery:progress",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "current": current,
            "total": total,
            "percentage": percentage,
            "etaSeconds": eta_seconds,
        }),
    )
}

/// Build a `recovery:found` event for one surfaced customer
#[must_use]
pub fn build_recovery_found_event(
    tenant_id: &str,
    instance_id: &str,
    contact_phone: &str,
    temperature: u8,
    estimated_value_cents: i64,
) -> Event {
    Event::new(
        "recovery:found",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "contactPhone": contact_phone,
            "temperature": temperature,
            "estimatedValueCents": estimated_value_cents,
        }),
    )
}

/// Build a `recovery:finished` event
#[must_use]
pub fn build_recovery_finished_event(
    tenant_id: &str,
    instance_id: &str,
    scanned: u32,
    found: u32,
    total_value_cents: i64,
) -> Event {
    Event::new(
        "recovery:finished",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "scanned": scanned,
            "found": found,
            "totalValueCents": total_value_cents,
        }),
    )
}

/// Build a `recovery:error` event
#[must_use]
pub fn build_recovery_error_event(tenant_id: &str, instance_id: &str, error: &str) -> Event {
    Event::new(
        "recovery:error",
        tenant_id,
        serde_json::json!({
            "instanceId": instance_id,
            "error": error,
        }),
    )
}

/// Build a `recoverycustomer:replied` event
#[must_use]
pub fn build_recovery_customer_replied_event(
    tenant_id: &str,
    customer_id: &str,
    contact_phone: &str,
) -> Event {
    Event::new(
        "recoverycustomer:replied",
        tenant_id,
        serde_json::json!({
            "customerId": customer_id,
            "contactPhone": contact_phone,
        }),
    )
}

/// Build a `recoverycustomer:converted` event
#[must_use]
pub fn build_recovery_customer_converted_event(
    tenant_id: &str,
    customer_id: &str,
    contact_phone: &str,
    converted_value_cents: Option<i64>,
) -> Event {
    Event::new(
        "recoverycustomer:converted",
        tenant_id,
        serde_json::json!({
            "customerId": customer_id,
            "contactPhone": contact_phone,
            "convertedValueCents": converted_value_cents,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_tenant_and_type() {
        let event =
            build_connection_update_event("org-1", "inst-1", "connected", Some("5511999990000"), None);
        assert_eq!(event.event_type, "connection:update");
        assert_eq!(event.tenant_id, "org-1");
        assert_eq!(event.data["instanceId"], "inst-1");
        assert_eq!(event.data["status"], "connected");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn pairing_event_carries_the_code() {
        let event = build_pairing_code_event("org-1", "inst-1", "CODE-0001");
        assert_eq!(event.event_type, "pairing:code");
        assert_eq!(event.data["code"], "CODE-0001");
    }

    #[tokio::test]
    async fn hub_isolates_tenants() {
        let hub = EventHub::new();
        let mut org1 = hub.subscribe("org-1");
        let mut org2 = hub.subscribe("org-2");

        hub.emit(build_message_received_event("org-1", "inst-1", "wamid-1", "5511988887777", "oi"));

        let got = org1.recv().await.unwrap();
        assert_eq!(got.event_type, "message:received");
        assert!(org2.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.emit(build_recovery_error_event("org-9", "inst-1", "boom"));
    }
}
