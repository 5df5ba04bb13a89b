//! Chat-protocol session management
//!
//! One session per tenant instance. The registry owns the live state
//! machines, drives reconnection with backoff, and mirrors transitions
//! into the instance repository.

mod bridge;
mod creds;
mod reconnect;
mod transport;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use bridge::{BridgeTransport, BridgeWebhook};
pub use creds::CredsStore;
pub use reconnect::{DisconnectReason, ReconnectPolicy};
pub use transport::{Transport, TransportEvent};

#[cfg(test)]
pub use transport::MockTransport;

use crate::db::InstanceRepo;
use crate::events::{
    build_connection_update_event, build_message_sent_event, build_pairing_code_event, SharedSink,
};
use crate::{Error, Result};

/// Connection lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Pairing,
    Connected,
    Error,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s {
            "connecting" => Self::Connecting,
            "pairing" => Self::Pairing,
            "connected" => Self::Connected,
            "error" => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

/// How long a pairing code stays usable
const PAIRING_CODE_TTL_SECS: i64 = 120;

/// Live state of one instance
#[derive(Debug, Clone)]
struct SessionState {
    tenant_id: String,
    status: ConnectionStatus,
    phone_number: Option<String>,
    /// Last issued pairing code and when it expires
    pairing_code: Option<(String, chrono::DateTime<chrono::Utc>)>,
    reconnect_attempts: u32,
    /// Whether this session has reached `Connected` before; the connected
    /// hook fires only on the first transition
    connected_before: bool,
}

impl SessionState {
    fn fresh(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            status: ConnectionStatus::Disconnected,
            phone_number: None,
            pairing_code: None,
            reconnect_attempts: 0,
            connected_before: false,
        }
    }
}

/// Callback fired when an instance reaches the connected state
pub type ConnectedHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionState>>,
    transport: Arc<dyn Transport>,
    creds: CredsStore,
    instances: InstanceRepo,
    events: SharedSink,
    policy: ReconnectPolicy,
    on_connected: RwLock<Option<ConnectedHook>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        creds: CredsStore,
        instances: InstanceRepo,
        events: SharedSink,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transport,
            creds,
            instances,
            events,
            policy: ReconnectPolicy::default(),
            on_connected: RwLock::new(None),
        }
    }

    /// Override the reconnect backoff policy
    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a callback fired the first time a session connects
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned
    pub fn set_connected_hook(&self, hook: ConnectedHook) {
        *self
            .on_connected
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    /// Current status of an instance
    #[must_use]
    pub fn status(&self, instance_id: &str) -> ConnectionStatus {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(instance_id)
            .map_or(ConnectionStatus::Disconnected, |s| s.status)
    }

    /// Statuses of every live session, for the health endpoint
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (id.clone(), s.status))
            .collect()
    }

    /// Start connecting an instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConnecting`] if a connection attempt is in
    /// flight, [`Error::AlreadyPaired`] if the instance is connected, or a
    /// transport error.
    pub async fn connect(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match sessions.get(instance_id).map(|s| s.status) {
                Some(ConnectionStatus::Connecting | ConnectionStatus::Pairing) => {
                    return Err(Error::AlreadyConnecting(instance_id.to_owned()));
                }
                Some(ConnectionStatus::Connected) => {
                    return Err(Error::AlreadyPaired(instance_id.to_owned()));
                }
                _ => {}
            }
            let state = sessions
                .entry(instance_id.to_owned())
                .or_insert_with(|| SessionState::fresh(tenant_id));
            state.status = ConnectionStatus::Connecting;
        }

        if let Err(e) = self.start_transport(tenant_id, instance_id).await {
            // Roll the state machine back so a retry is not refused with
            // AlreadyConnecting forever
            self.mark_disconnected(tenant_id, instance_id, &e.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn start_transport(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        self.instances.upsert_status(
            tenant_id,
            instance_id,
            ConnectionStatus::Connecting,
            None,
            None,
        )?;

        let creds = self.creds.load(instance_id)?;
        tracing::info!(instance_id, has_creds = creds.is_some(), "connecting instance");
        self.transport.connect(instance_id, creds.as_deref()).await
    }

    fn mark_disconnected(&self, tenant_id: &str, instance_id: &str, error: &str) {
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = sessions.get_mut(instance_id) {
                state.status = ConnectionStatus::Disconnected;
            }
        }
        if let Err(e) = self.instances.upsert_status(
            tenant_id,
            instance_id,
            ConnectionStatus::Disconnected,
            None,
            Some(error),
        ) {
            tracing::error!(instance_id, error = %e, "failed to persist disconnect");
        }
    }

    /// Request a phone-number pairing code for an instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhoneFormat`] for a malformed number,
    /// [`Error::AlreadyPaired`] if the instance is connected, or a
    /// transport error.
    pub async fn pairing_code(
        &self,
        tenant_id: &str,
        instance_id: &str,
        phone: &str,
    ) -> Result<String> {
        let normalized = normalize_phone(phone)?;

        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // A fresh instance may request a code before ever connecting
            let state = sessions
                .entry(instance_id.to_owned())
                .or_insert_with(|| SessionState::fresh(tenant_id));
            if state.status == ConnectionStatus::Connected {
                return Err(Error::AlreadyPaired(instance_id.to_owned()));
            }
            // A still-valid code is handed back instead of re-pairing
            if let Some((code, expires_at)) = &state.pairing_code {
                if *expires_at > chrono::Utc::now() {
                    return Ok(code.clone());
                }
            }
            state.status = ConnectionStatus::Pairing;
        }

        self.instances.upsert_status(
            tenant_id,
            instance_id,
            ConnectionStatus::Pairing,
            Some(&normalized),
            None,
        )?;

        let code = self
            .transport
            .request_pairing_code(instance_id, &normalized)
            .await?;
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = sessions.get_mut(instance_id) {
                let expires_at =
                    chrono::Utc::now() + chrono::Duration::seconds(PAIRING_CODE_TTL_SECS);
                state.pairing_code = Some((code.clone(), expires_at));
            }
        }
        self.events
            .emit(build_pairing_code_event(tenant_id, instance_id, &code));
        Ok(code)
    }

    /// Send a text message through a connected instance, returning the
    /// transport message id. Every delivery emits a `message:sent` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the instance is not connected,
    /// or a transport error.
    pub async fn send_text(
        &self,
        instance_id: &str,
        to: &str,
        content: &str,
        sent_by_ai: bool,
    ) -> Result<String> {
        let tenant_id = {
            let sessions = self
                .sessions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match sessions.get(instance_id) {
                Some(state) if state.status == ConnectionStatus::Connected => {
                    state.tenant_id.clone()
                }
                _ => return Err(Error::NotConnected(instance_id.to_owned())),
            }
        };
        let message_id = self.transport.send_text(instance_id, to, content).await?;
        self.events.emit(build_message_sent_event(
            &tenant_id,
            instance_id,
            to,
            &message_id,
            sent_by_ai,
        ));
        Ok(message_id)
    }

    /// Tear down one session and forget it
    ///
    /// # Errors
    ///
    /// Returns a transport error if the disconnect call fails; the local
    /// state is removed either way.
    pub async fn close(&self, instance_id: &str) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(instance_id);
        let Some(state) = removed else {
            return Ok(());
        };

        if let Err(e) = self.instances.upsert_status(
            &state.tenant_id,
            instance_id,
            ConnectionStatus::Disconnected,
            None,
            None,
        ) {
            tracing::error!(instance_id, error = %e, "failed to persist close");
        }
        self.transport.disconnect(instance_id).await
    }

    /// Tear down every live session, used on shutdown
    pub async fn close_all(&self) {
        let ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(instance_id = %id, error = %e, "disconnect failed on shutdown");
            }
        }
    }

    /// Tenant that owns an instance, if the session is live
    #[must_use]
    pub fn tenant_of(&self, instance_id: &str) -> Option<String> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(instance_id)
            .map(|s| s.tenant_id.clone())
    }

    /// Apply a transport lifecycle event to the state machine
    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                instance_id,
                phone_number,
                creds,
            } => self.on_connected(&instance_id, phone_number, creds),
            TransportEvent::Disconnected {
                instance_id,
                reason,
            } => self.on_disconnected(&instance_id, &reason),
            TransportEvent::MessageReceived { .. } => {
                // inbound messages are routed by the daemon, not the registry
            }
        }
    }

    fn on_connected(&self, instance_id: &str, phone_number: Option<String>, creds: Option<Vec<u8>>) {
        let (tenant_id, first_connect) = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(state) = sessions.get_mut(instance_id) else {
                tracing::warn!(instance_id, "connected event for unknown session");
                return;
            };
            state.status = ConnectionStatus::Connected;
            state.phone_number.clone_from(&phone_number);
            state.pairing_code = None;
            state.reconnect_attempts = 0;
            let first = !state.connected_before;
            state.connected_before = true;
            (state.tenant_id.clone(), first)
        };

        if let Some(bytes) = creds {
            if let Err(e) = self.creds.save(instance_id, &bytes) {
                tracing::error!(instance_id, error = %e, "failed to persist credentials");
            }
        }

        if let Err(e) = self.instances.upsert_status(
            &tenant_id,
            instance_id,
            ConnectionStatus::Connected,
            phone_number.as_deref(),
            None,
        ) {
            tracing::error!(instance_id, error = %e, "failed to persist connected status");
        }

        tracing::info!(instance_id, tenant_id, "instance connected");
        self.events.emit(build_connection_update_event(
            &tenant_id,
            instance_id,
            ConnectionStatus::Connected.as_str(),
            phone_number.as_deref(),
            None,
        ));

        // Reconnects must not fire the hook again
        if first_connect {
            let hook = self
                .on_connected
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(hook) = hook.as_ref() {
                hook(&tenant_id, instance_id);
            }
        }
    }

    fn on_disconnected(self: &Arc<Self>, instance_id: &str, reason: &DisconnectReason) {
        let (tenant_id, attempts) = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(state) = sessions.get_mut(instance_id) else {
                return;
            };
            state.status = ConnectionStatus::Disconnected;
            if reason.should_reconnect() {
                state.reconnect_attempts += 1;
            } else {
                state.reconnect_attempts = 0;
            }
            (state.tenant_id.clone(), state.reconnect_attempts)
        };

        tracing::warn!(instance_id, %reason, attempts, "instance disconnected");
        self.events.emit(build_connection_update_event(
            &tenant_id,
            instance_id,
            ConnectionStatus::Disconnected.as_str(),
            None,
            Some(reason.as_str()),
        ));

        if let Err(e) = self.instances.upsert_status(
            &tenant_id,
            instance_id,
            ConnectionStatus::Disconnected,
            None,
            Some(reason.as_str()),
        ) {
            tracing::error!(instance_id, error = %e, "failed to persist disconnect");
        }

        if *reason == DisconnectReason::LoggedOut {
            // Stale credentials would loop a dead session forever
            if let Err(e) = self.creds.wipe(instance_id) {
                tracing::error!(instance_id, error = %e, "failed to wipe credentials");
            }
            return;
        }
        if !reason.should_reconnect() {
            return;
        }

        let Some(delay) = self.policy.delay(attempts) else {
            tracing::error!(instance_id, attempts, "reconnect attempts exhausted");
            self.mark_error(&tenant_id, instance_id, "reconnect attempts exhausted");
            return;
        };

        let registry = Arc::clone(self);
        let tenant = tenant_id;
        let instance = instance_id.to_owned();
        drop(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A manual connect may have raced us while we slept
            if registry.status(&instance) != ConnectionStatus::Disconnected {
                return;
            }
            tracing::info!(instance_id = %instance, "attempting reconnect");
            if let Err(e) = registry.reconnect(&tenant, &instance).await {
                tracing::error!(instance_id = %instance, error = %e, "reconnect failed");
                // Feed the failure back into the backoff loop; the attempt
                // budget decides when to give up
                registry.on_disconnected(&instance, &DisconnectReason::Other(e.to_string()));
            }
        }));
    }

    /// Like [`connect`](Self::connect) but keeps the attempt counter
    async fn reconnect(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = sessions.get_mut(instance_id) {
                state.status = ConnectionStatus::Connecting;
            }
        }
        self.start_transport(tenant_id, instance_id).await
    }

    fn mark_error(&self, tenant_id: &str, instance_id: &str, message: &str) {
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = sessions.get_mut(instance_id) {
                state.status = ConnectionStatus::Error;
            }
        }
        self.events.emit(build_connection_update_event(
            tenant_id,
            instance_id,
            ConnectionStatus::Error.as_str(),
            None,
            Some(message),
        ));
        if let Err(e) = self.instances.upsert_status(
            tenant_id,
            instance_id,
            ConnectionStatus::Error,
            None,
            Some(message),
        ) {
            tracing::error!(instance_id, error = %e, "failed to persist error status");
        }
    }
}

/// Normalize a phone number to bare digits
///
/// # Errors
///
/// Returns [`Error::InvalidPhoneFormat`] unless the number has 10 to 15
/// digits after stripping separators
pub fn normalize_phone(phone: &str) -> Result<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if !(10..=15).contains(&digits.len()) {
        return Err(Error::InvalidPhoneFormat(phone.to_owned()));
    }
    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::events::EventHub;
    use transport::MockTransport;

    fn registry() -> (Arc<SessionRegistry>, Arc<MockTransport>, Arc<EventHub>) {
        let transport = Arc::new(MockTransport::default());
        let hub = Arc::new(EventHub::new());
        let dir = std::env::temp_dir().join(format!("courier-test-{}", uuid::Uuid::new_v4()));
        let creds = CredsStore::new(dir.join("primary"), dir.join("backup"));
        let registry = Arc::new(SessionRegistry::new(
            transport.clone(),
            creds,
            InstanceRepo::new(init_memory().unwrap()),
            hub.clone(),
        ));
        (registry, transport, hub)
    }

    #[tokio::test]
    async fn connect_rejects_concurrent_attempts() {
        let (registry, _, _) = registry();

        registry.connect("org-1", "inst-1").await.unwrap();
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Connecting);

        let err = registry.connect("org-1", "inst-1").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnecting(_)));
    }

    #[tokio::test]
    async fn pairing_code_validates_phone() {
        let (registry, _, _) = registry();
        registry.connect("org-1", "inst-1").await.unwrap();

        let err = registry
            .pairing_code("org-1", "inst-1", "not-a-phone")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPhoneFormat(_)));

        let code = registry
            .pairing_code("org-1", "inst-1", "+55 (11) 98888-7777")
            .await
            .unwrap();
        assert!(!code.is_empty());
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Pairing);
    }

    #[tokio::test]
    async fn pairing_code_is_cached_until_expiry() {
        let (registry, transport, _) = registry();
        registry.connect("org-1", "inst-1").await.unwrap();

        let first = registry
            .pairing_code("org-1", "inst-1", "5511988887777")
            .await
            .unwrap();
        let second = registry
            .pairing_code("org-1", "inst-1", "5511988887777")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.pairing_calls(), 1);
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let (registry, _, _) = registry();
        let err = registry
            .send_text("inst-1", "5511988887777", "oi", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn send_emits_message_sent() {
        let (registry, _, hub) = registry();
        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: None,
                creds: None,
            })
            .await;
        let mut rx = hub.subscribe("org-1");

        let message_id = registry
            .send_text("inst-1", "5511988887777", "oi", false)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "message:sent");
        assert_eq!(event.data["messageId"], message_id);
        assert_eq!(event.data["contactPhone"], "5511988887777");
        assert_eq!(event.data["sentByAi"], false);
    }

    #[tokio::test]
    async fn failed_connect_rolls_back_to_disconnected() {
        let (registry, transport, _) = registry();
        transport
            .fail_connects
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = registry.connect("org-1", "inst-1").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Disconnected);

        // the failure does not wedge the slot
        transport
            .fail_connects
            .store(false, std::sync::atomic::Ordering::SeqCst);
        registry.connect("org-1", "inst-1").await.unwrap();
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn failed_reconnects_back_off_until_error() {
        let transport = Arc::new(MockTransport::default());
        let dir = std::env::temp_dir().join(format!("courier-test-{}", uuid::Uuid::new_v4()));
        let registry = Arc::new(
            SessionRegistry::new(
                transport.clone(),
                CredsStore::new(dir.join("primary"), dir.join("backup")),
                InstanceRepo::new(init_memory().unwrap()),
                Arc::new(EventHub::new()),
            )
            .with_policy(ReconnectPolicy {
                base: std::time::Duration::from_millis(1),
                factor: 1.0,
                cap: std::time::Duration::from_millis(1),
                max_attempts: 2,
            }),
        );

        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: None,
                creds: None,
            })
            .await;
        transport
            .fail_connects
            .store(true, std::sync::atomic::Ordering::SeqCst);
        registry
            .handle_event(TransportEvent::Disconnected {
                instance_id: "inst-1".to_owned(),
                reason: DisconnectReason::ConnectionClosed,
            })
            .await;

        // both budgeted reconnects fail, then the session is marked error
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Error);
        assert_eq!(transport.connect_calls(), 3);
    }

    #[tokio::test]
    async fn connected_event_transitions_and_fires_hook() {
        let (registry, _, hub) = registry();
        let mut rx = hub.subscribe("org-1");

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        registry.set_connected_hook(Box::new(move |tenant, instance| {
            assert_eq!(tenant, "org-1");
            assert_eq!(instance, "inst-1");
            fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: Some("5511999990000".to_owned()),
                creds: None,
            })
            .await;

        assert_eq!(registry.status("inst-1"), ConnectionStatus::Connected);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "connection:update");
        assert_eq!(event.data["status"], "connected");

        // a second pairing attempt on a live session is refused
        let err = registry
            .pairing_code("org-1", "inst-1", "5511988887777")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyPaired(_)));
    }

    #[tokio::test]
    async fn hook_fires_once_across_reconnects() {
        let (registry, _, _) = registry();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_clone = count.clone();
        registry.set_connected_hook(Box::new(move |_, _| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        registry.connect("org-1", "inst-1").await.unwrap();
        let connected = TransportEvent::Connected {
            instance_id: "inst-1".to_owned(),
            phone_number: None,
            creds: None,
        };
        registry.handle_event(connected.clone()).await;
        registry
            .handle_event(TransportEvent::Disconnected {
                instance_id: "inst-1".to_owned(),
                reason: DisconnectReason::ConnectionClosed,
            })
            .await;
        registry.handle_event(connected).await;

        assert_eq!(registry.status("inst-1"), ConnectionStatus::Connected);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pairing_code_works_before_first_connect() {
        let (registry, _, _) = registry();

        // no connect() beforehand; requesting a code claims the slot
        let code = registry
            .pairing_code("org-1", "inst-1", "5511988887777")
            .await
            .unwrap();
        assert!(!code.is_empty());
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Pairing);
        assert_eq!(registry.tenant_of("inst-1").as_deref(), Some("org-1"));
    }

    #[tokio::test]
    async fn logged_out_wipes_creds_and_stays_down() {
        let (registry, transport, _) = registry();
        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: None,
                creds: Some(b"secret".to_vec()),
            })
            .await;

        registry
            .handle_event(TransportEvent::Disconnected {
                instance_id: "inst-1".to_owned(),
                reason: DisconnectReason::LoggedOut,
            })
            .await;

        assert_eq!(registry.status("inst-1"), ConnectionStatus::Disconnected);
        // no reconnect was attempted
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn close_disconnects_and_forgets() {
        let (registry, _, _) = registry();
        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: None,
                creds: None,
            })
            .await;

        registry.close("inst-1").await.unwrap();
        assert_eq!(registry.status("inst-1"), ConnectionStatus::Disconnected);
        assert!(registry.tenant_of("inst-1").is_none());

        // closing an unknown instance is a no-op
        registry.close("inst-1").await.unwrap();
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+55 (11) 98888-7777").unwrap(), "5511988887777");
        assert!(normalize_phone("123").is_err());
        assert!(normalize_phone("").is_err());
    }
}
