//! Recovery scan execution

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::{build_recovery_error_event, SharedSink};
use crate::jobs::{Job, JobError, JobOutcome, RecoveryScanJob};
use crate::pipeline::JobHandler;
use crate::recovery::RecoveryScanner;

pub struct RecoveryWorker {
    scanner: Arc<RecoveryScanner>,
    events: SharedSink,
}

impl RecoveryWorker {
    #[must_use]
    pub fn new(scanner: Arc<RecoveryScanner>, events: SharedSink) -> Self {
        Self { scanner, events }
    }
}

#[async_trait]
impl JobHandler for RecoveryWorker {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let scan: RecoveryScanJob = job.parse().map_err(JobError::Fatal)?;

        match self
            .scanner
            .run(&job.tenant_id, &scan.instance_id, scan.force)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // A failed scan hurts only this tenant's run
                self.events.emit(build_recovery_error_event(
                    &job.tenant_id,
                    &scan.instance_id,
                    &e.to_string(),
                ));
                Err(JobError::from_error(e))
            }
        }
    }
}
