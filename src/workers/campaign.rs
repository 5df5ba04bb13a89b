//! Bulk campaign delivery
//!
//! Recipients are processed strictly in list order with an inter-send
//! delay. Individual failures are counted, never fatal; the campaign
//! always reaches 100 percent progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::JobStore;
use crate::events::{build_campaign_finished_event, build_campaign_progress_event, SharedSink};
use crate::jobs::{CampaignJob, Job, JobError, JobOutcome};
use crate::pipeline::JobHandler;
use crate::session::{ConnectionStatus, SessionRegistry};
use crate::workers::render_template;
use crate::Error;

pub struct CampaignWorker {
    registry: Arc<SessionRegistry>,
    store: JobStore,
    events: SharedSink,
    send_delay: Duration,
}

impl CampaignWorker {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: JobStore,
        events: SharedSink,
        send_delay: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            send_delay,
        }
    }
}

#[async_trait]
impl JobHandler for CampaignWorker {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let campaign: CampaignJob = job.parse().map_err(JobError::Fatal)?;

        // A dead instance fails the whole campaign up front, before any
        // recipient has been attempted, so the retry starts from zero
        if self.registry.status(&campaign.instance_id) != ConnectionStatus::Connected {
            return Err(JobError::Retryable(Error::NotConnected(
                campaign.instance_id.clone(),
            )));
        }

        let content = render_template(&campaign.template, &campaign.variables);
        let total = u32::try_from(campaign.recipients.len()).unwrap_or(u32::MAX);
        let mut sent: u32 = 0;
        let mut failed: u32 = 0;

        for (i, recipient) in campaign.recipients.iter().enumerate() {
            match self
                .registry
                .send_text(&campaign.instance_id, recipient, &content, false)
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        campaign_id = %campaign.campaign_id,
                        recipient = %recipient,
                        error = %e,
                        "campaign send failed"
                    );
                }
            }

            let current = u32::try_from(i + 1).unwrap_or(u32::MAX);
            let percentage =
                u32::try_from(u64::from(current) * 100 / u64::from(total.max(1))).unwrap_or(100);
            if let Err(e) = self.store.set_progress(&job.id, u8::try_from(percentage).unwrap_or(100)) {
                tracing::warn!(job_id = %job.id, error = %e, "progress update failed");
            }
            self.events.emit(build_campaign_progress_event(
                &job.tenant_id,
                &campaign.campaign_id,
                sent,
                failed,
                total,
                percentage,
            ));

            if current < total {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        tracing::info!(
            campaign_id = %campaign.campaign_id,
            sent,
            failed,
            total,
            "campaign finished"
        );
        // The run record keeps the tallies even when nobody is subscribed
        if let Err(e) = self.store.set_result(
            &job.id,
            &serde_json::json!({ "sent": sent, "failed": failed, "total": total }),
        ) {
            tracing::warn!(job_id = %job.id, error = %e, "result update failed");
        }
        self.events.emit(build_campaign_finished_event(
            &job.tenant_id,
            &campaign.campaign_id,
            sent,
            failed,
        ));
        Ok(())
    }
}
