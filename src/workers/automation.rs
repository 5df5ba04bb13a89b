//! Scheduled reminders and follow-ups

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{ConversationRepo, Direction};
use crate::jobs::{AutomationJob, Job, JobError, JobOutcome};
use crate::pipeline::JobHandler;
use crate::session::SessionRegistry;
use crate::workers::render_template;

pub struct AutomationWorker {
    registry: Arc<SessionRegistry>,
    conversations: ConversationRepo,
}

impl AutomationWorker {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, conversations: ConversationRepo) -> Self {
        Self {
            registry,
            conversations,
        }
    }

    async fn process(&self, tenant_id: &str, automation: &AutomationJob) -> crate::Result<()> {
        let mut variables = automation.variables.clone();
        if let Some(name) = &automation.contact_name {
            variables.entry("name".to_owned()).or_insert_with(|| name.clone());
        }
        let content = render_template(&automation.content, &variables);

        self.registry
            .send_text(&automation.instance_id, &automation.contact_phone, &content, false)
            .await?;

        self.conversations.record_message(
            tenant_id,
            &automation.instance_id,
            &automation.contact_phone,
            automation.contact_name.as_deref(),
            Direction::Outbound,
            &content,
            false,
        )?;

        tracing::info!(
            automation_id = %automation.automation_id,
            kind = ?automation.kind,
            contact = %automation.contact_phone,
            "automation delivered"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AutomationWorker {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let automation: AutomationJob = job.parse().map_err(JobError::Fatal)?;
        self.process(&job.tenant_id, &automation)
            .await
            .map_err(JobError::from_error)
    }
}
