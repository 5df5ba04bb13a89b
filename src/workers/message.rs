//! Inbound message handling
//!
//! Records the inbound turn, then either routes it through untouched
//! (authorized owner speaking as the business) or generates and sends an
//! AI reply.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ai::ReplyGenerator;
use crate::db::{ConversationRepo, Direction, OwnerRepo};
use crate::events::{build_message_received_event, SharedSink};
use crate::jobs::{Job, JobError, JobOutcome, MessageJob};
use crate::pipeline::JobHandler;
use crate::session::SessionRegistry;

pub struct MessageWorker {
    registry: Arc<SessionRegistry>,
    conversations: ConversationRepo,
    owners: OwnerRepo,
    replies: Arc<dyn ReplyGenerator>,
    events: SharedSink,
}

impl MessageWorker {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        conversations: ConversationRepo,
        owners: OwnerRepo,
        replies: Arc<dyn ReplyGenerator>,
        events: SharedSink,
    ) -> Self {
        Self {
            registry,
            conversations,
            owners,
            replies,
            events,
        }
    }

    async fn process(&self, tenant_id: &str, msg: &MessageJob) -> crate::Result<()> {
        let conversation_id = self.conversations.record_message(
            tenant_id,
            &msg.instance_id,
            &msg.contact_phone,
            msg.contact_name.as_deref(),
            Direction::Inbound,
            &msg.content,
            false,
        )?;

        self.events.emit(build_message_received_event(
            tenant_id,
            &msg.instance_id,
            &msg.message_id,
            &msg.contact_phone,
            &msg.content,
        ));

        // Owners speak as the business; nothing to answer
        if self.owners.is_owner(tenant_id, &msg.contact_phone)? {
            tracing::debug!(
                tenant_id,
                contact = %msg.contact_phone,
                "owner message, skipping auto-reply"
            );
            return Ok(());
        }

        let history = self.conversations.recent_messages(&conversation_id, 10)?;
        let reply = self
            .replies
            .answer_message(msg.contact_name.as_deref(), &history)
            .await?;

        self.registry
            .send_text(&msg.instance_id, &msg.contact_phone, &reply, true)
            .await?;

        self.conversations.record_message(
            tenant_id,
            &msg.instance_id,
            &msg.contact_phone,
            None,
            Direction::Outbound,
            &reply,
            true,
        )?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for MessageWorker {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let msg: MessageJob = job.parse().map_err(JobError::Fatal)?;
        self.process(&job.tenant_id, &msg)
            .await
            .map_err(JobError::from_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockReplyGenerator;
    use crate::db::{init_memory, InstanceRepo};
    use crate::events::EventHub;
    use crate::jobs::QueueKind;
    use crate::session::{CredsStore, MockTransport, TransportEvent};

    async fn setup() -> (MessageWorker, Arc<MockTransport>, crate::db::DbPool) {
        let pool = init_memory().unwrap();
        let hub: SharedSink = Arc::new(EventHub::new());
        let transport = Arc::new(MockTransport::default());
        let dir = std::env::temp_dir().join(format!("courier-test-{}", uuid::Uuid::new_v4()));
        let registry = Arc::new(SessionRegistry::new(
            transport.clone(),
            CredsStore::new(dir.join("p"), dir.join("b")),
            InstanceRepo::new(pool.clone()),
            hub.clone(),
        ));
        registry.connect("org-1", "inst-1").await.unwrap();
        registry
            .handle_event(TransportEvent::Connected {
                instance_id: "inst-1".to_owned(),
                phone_number: None,
                creds: None,
            })
            .await;

        let worker = MessageWorker::new(
            registry,
            ConversationRepo::new(pool.clone()),
            OwnerRepo::new(pool.clone()),
            Arc::new(MockReplyGenerator::default()),
            hub,
        );
        (worker, transport, pool)
    }

    fn message_job(phone: &str) -> Job {
        Job::new(
            QueueKind::Message,
            "org-1",
            &MessageJob {
                instance_id: "inst-1".to_owned(),
                message_id: "wamid-1".to_owned(),
                contact_phone: phone.to_owned(),
                contact_name: Some("Ana".to_owned()),
                content: "quanto custa o banho?".to_owned(),
                received_at: chrono::Utc::now(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn customer_message_gets_ai_reply() {
        let (worker, transport, pool) = setup().await;

        worker.handle(&message_job("5511988887777")).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "5511988887777");

        // both turns were recorded
        let conversations = ConversationRepo::new(pool);
        let id = conversations
            .record_message("org-1", "inst-1", "5511988887777", None, Direction::Inbound, "x", false)
            .unwrap();
        assert_eq!(conversations.message_count(&id).unwrap(), 3);
    }

    #[tokio::test]
    async fn owner_message_skips_ai() {
        let (worker, transport, pool) = setup().await;
        OwnerRepo::new(pool)
            .register("org-1", "5511999990000", Some("Bruno"))
            .unwrap();

        worker.handle(&message_job("5511999990000")).await.unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_retryable() {
        let (worker, transport, _pool) = setup().await;
        transport
            .fail_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = worker.handle(&message_job("5511988887777")).await.unwrap_err();
        assert!(matches!(err, JobError::Retryable(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let (worker, _, _) = setup().await;
        let mut job = message_job("5511988887777");
        job.payload = serde_json::json!({"nope": true});

        let err = worker.handle(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
    }
}
