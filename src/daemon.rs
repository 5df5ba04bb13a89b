//! Daemon - the main gateway service
//!
//! Wires the session registry, job pipeline, worker pools, recovery
//! scanner, and HTTP API together and runs until interrupted.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ai::HttpReplyGenerator;
use crate::api::{ApiServer, ApiState};
use crate::broker::{BrokerGuard, JobStore};
use crate::db::{self, ConversationRepo, DbPool, ForgottenRepo, InstanceRepo, OwnerRepo};
use crate::events::{EventHub, SharedSink};
use crate::jobs::{Job, QueueKind, RecoveryScanJob};
use crate::pipeline::{
    per_minute_limiter, per_second_limiter, start_worker, JobPipeline, WorkerConfig, WorkerHandle,
};
use crate::recovery::RecoveryScanner;
use crate::session::{BridgeTransport, CredsStore, SessionRegistry};
use crate::workers::{AutomationWorker, CampaignWorker, MessageWorker, RecoveryWorker};
use crate::{Config, Result};

/// The Courier daemon - orchestrates sessions, queues, and recovery
pub struct Daemon {
    config: Config,
    port: u16,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the broker database cannot be opened
    pub fn new(config: Config, port: u16) -> Result<Self> {
        let db = db::init(&config.broker_path)?;
        tracing::info!(path = %config.broker_path.display(), "broker database initialized");

        Ok(Self { config, port, db })
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a component fails to start
    pub async fn run(self) -> Result<()> {
        let hub = Arc::new(EventHub::new());
        let events: SharedSink = hub.clone();

        let guard = Arc::new(BrokerGuard::new());
        let store = JobStore::new(self.db.clone());
        let pipeline = JobPipeline::new(store.clone(), Arc::clone(&guard));

        let instances = InstanceRepo::new(self.db.clone());
        let conversations = ConversationRepo::new(self.db.clone());
        let owners = OwnerRepo::new(self.db.clone());
        let forgotten = ForgottenRepo::new(self.db.clone());

        let transport = Arc::new(BridgeTransport::new(&self.config.bridge));
        let creds = CredsStore::new(&self.config.session_dir, &self.config.session_backup_dir);
        let registry = Arc::new(SessionRegistry::new(
            transport,
            creds,
            instances.clone(),
            Arc::clone(&events),
        ));

        // First successful connect schedules a recovery scan after a short
        // settling delay
        let scan_pipeline = pipeline.clone();
        let scan_forgotten = forgotten.clone();
        let trigger_delay = self.config.recovery.trigger_delay;
        registry.set_connected_hook(Box::new(move |tenant_id, instance_id| {
            schedule_initial_scan(
                &scan_pipeline,
                &scan_forgotten,
                trigger_delay,
                tenant_id,
                instance_id,
            );
        }));

        let replies: Arc<dyn crate::ai::ReplyGenerator> =
            Arc::new(HttpReplyGenerator::new(self.config.ai.clone()));
        let scanner = Arc::new(RecoveryScanner::new(
            conversations.clone(),
            forgotten.clone(),
            Arc::clone(&replies),
            Arc::clone(&events),
            self.config.recovery.clone(),
        ));

        let workers = self.start_workers(
            &pipeline,
            &store,
            &registry,
            &conversations,
            &owners,
            &scanner,
            Arc::clone(&replies),
            &events,
        );

        let api = ApiServer::new(
            ApiState {
                registry: Arc::clone(&registry),
                pipeline: pipeline.clone(),
                hub,
                instances,
                forgotten,
            },
            self.port,
        );
        let api_handle = api.spawn();

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        tracing::info!(port = self.port, "courier gateway running");
        shutdown_rx.recv().await;

        tracing::info!("shutting down, draining worker pools");
        for handle in workers {
            handle.close().await;
        }
        registry.close_all().await;
        api_handle.abort();

        tracing::info!("daemon stopped");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_workers(
        &self,
        pipeline: &JobPipeline,
        store: &JobStore,
        registry: &Arc<SessionRegistry>,
        conversations: &ConversationRepo,
        owners: &OwnerRepo,
        scanner: &Arc<RecoveryScanner>,
        replies: Arc<dyn crate::ai::ReplyGenerator>,
        events: &SharedSink,
    ) -> Vec<WorkerHandle> {
        let queues = &self.config.queues;

        let message = MessageWorker::new(
            Arc::clone(registry),
            conversations.clone(),
            owners.clone(),
            replies,
            Arc::clone(events),
        );
        let automation = AutomationWorker::new(Arc::clone(registry), conversations.clone());
        let campaign = CampaignWorker::new(
            Arc::clone(registry),
            store.clone(),
            Arc::clone(events),
            queues.campaign_send_delay,
        );
        let recovery = RecoveryWorker::new(Arc::clone(scanner), Arc::clone(events));

        vec![
            start_worker(
                pipeline,
                QueueKind::Message,
                Arc::new(message),
                WorkerConfig {
                    concurrency: queues.message_concurrency,
                    poll_interval: queues.poll_interval,
                    limiter: Some(per_second_limiter(queues.message_per_second)),
                    ..WorkerConfig::default()
                },
            ),
            start_worker(
                pipeline,
                QueueKind::Automation,
                Arc::new(automation),
                WorkerConfig {
                    concurrency: queues.automation_concurrency,
                    poll_interval: queues.poll_interval,
                    ..WorkerConfig::default()
                },
            ),
            start_worker(
                pipeline,
                QueueKind::Campaign,
                Arc::new(campaign),
                WorkerConfig {
                    concurrency: queues.campaign_concurrency,
                    poll_interval: queues.poll_interval,
                    limiter: Some(per_minute_limiter(queues.campaign_per_minute)),
                    ..WorkerConfig::default()
                },
            ),
            start_worker(
                pipeline,
                QueueKind::Recovery,
                Arc::new(recovery),
                WorkerConfig {
                    concurrency: 1,
                    poll_interval: queues.poll_interval,
                    limiter: Some(per_minute_limiter(queues.recovery_per_minute)),
                    ..WorkerConfig::default()
                },
            ),
        ]
    }
}

/// Enqueue the one-time recovery scan for a freshly connected instance.
/// An instance that already has forgotten-customer records was scanned in
/// a previous run and is skipped.
fn schedule_initial_scan(
    pipeline: &JobPipeline,
    forgotten: &ForgottenRepo,
    trigger_delay: std::time::Duration,
    tenant_id: &str,
    instance_id: &str,
) {
    match forgotten.has_any_for_instance(tenant_id, instance_id) {
        Ok(true) => {
            tracing::debug!(instance_id, "recovery scan already ran, skipping");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(instance_id, error = %e, "forgotten lookup failed, scheduling scan anyway");
        }
    }

    let job = Job::new(
        QueueKind::Recovery,
        tenant_id,
        &RecoveryScanJob {
            instance_id: instance_id.to_owned(),
            force: false,
        },
    );
    match job {
        Ok(job) => {
            if let Err(e) = pipeline.enqueue(job, Some(trigger_delay)) {
                tracing::warn!(instance_id, error = %e, "failed to schedule recovery scan");
            }
        }
        Err(e) => {
            tracing::warn!(instance_id, error = %e, "failed to build recovery scan job");
        }
    }
}
