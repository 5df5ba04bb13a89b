//! Job pipeline
//!
//! The pipeline front door checks the broker guard, workers poll their
//! queue with jittered intervals, and handler outcomes decide between
//! rescheduling and the dead-letter table.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::broker::{BrokerGuard, JobStore};
use crate::jobs::{Job, JobError, JobOutcome, QueueKind};
use crate::{Error, Result};

/// Shared direct rate limiter
pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// An active claim older than this belongs to a worker that died
const STALE_CLAIM_AFTER: Duration = Duration::from_secs(300);

/// Create a limiter with the given jobs-per-second burst capacity
#[must_use]
pub fn per_second_limiter(jobs_per_second: u32) -> SharedLimiter {
    let jps = NonZeroU32::new(jobs_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(jps)))
}

/// Create a limiter with the given jobs-per-minute burst capacity
#[must_use]
pub fn per_minute_limiter(jobs_per_minute: u32) -> SharedLimiter {
    let jpm = NonZeroU32::new(jobs_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(jpm)))
}

/// Executes one kind of job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// Front door to the broker
#[derive(Clone)]
pub struct JobPipeline {
    store: JobStore,
    guard: Arc<BrokerGuard>,
}

impl JobPipeline {
    #[must_use]
    pub fn new(store: JobStore, guard: Arc<BrokerGuard>) -> Self {
        Self { store, guard }
    }

    #[must_use]
    pub fn guard(&self) -> &BrokerGuard {
        &self.guard
    }

    #[must_use]
    pub const fn store(&self) -> &JobStore {
        &self.store
    }

    /// Enqueue a job, optionally delayed. Returns the job id.
    ///
    /// The broker guard is advisory: an open guard is logged but the write
    /// is still attempted, and the store's own answer decides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerUnavailable`] when the write fails while the
    /// guard is open, or a storage error
    pub fn enqueue(&self, job: Job, delay: Option<Duration>) -> Result<String> {
        if !self.guard.is_available() {
            tracing::warn!(queue = %job.queue, "broker guard open, attempting enqueue anyway");
        }

        match self.store.enqueue(&job, delay) {
            Ok(()) => {
                self.guard.record_success();
                Ok(job.id)
            }
            Err(e) => {
                self.guard.record_failure();
                if self.guard.is_available() {
                    Err(e)
                } else {
                    Err(Error::BrokerUnavailable(e.to_string()))
                }
            }
        }
    }

    /// Enqueue a job to run at an absolute time. A time in the past means
    /// the job is ready immediately.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::enqueue`]
    pub fn enqueue_at(&self, job: Job, run_at: chrono::DateTime<chrono::Utc>) -> Result<String> {
        let delay = (run_at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.enqueue(job, Some(delay))
    }
}

/// Tuning for one worker pool
#[derive(Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub jitter: Duration,
    /// Throughput cap shared by every worker in the pool
    pub limiter: Option<SharedLimiter>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            limiter: None,
        }
    }
}

/// Handle to a running worker pool
pub struct WorkerHandle {
    queue: QueueKind,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for in-flight jobs to finish
    pub async fn close(self) {
        tracing::info!(queue = %self.queue, "worker pool shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(queue = %self.queue, error = %e, "worker task panicked");
            }
        }
    }
}

/// Start a worker pool for one queue
#[must_use]
pub fn start_worker(
    pipeline: &JobPipeline,
    queue: QueueKind,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
) -> WorkerHandle {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::with_capacity(config.concurrency);

    for i in 1..=config.concurrency {
        let worker = Worker {
            store: pipeline.store.clone(),
            guard: Arc::clone(&pipeline.guard),
            queue,
            handler: Arc::clone(&handler),
            poll_interval: config.poll_interval,
            jitter: config.jitter,
            limiter: config.limiter.clone(),
            shutdown: shutdown.subscribe(),
        };
        tracing::info!(queue = %queue, worker = i, "starting worker");
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }

    WorkerHandle {
        queue,
        shutdown,
        tasks,
    }
}

struct Worker {
    store: JobStore,
    guard: Arc<BrokerGuard>,
    queue: QueueKind,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    jitter: Duration,
    limiter: Option<SharedLimiter>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.run_next_job().await {
                Ok(true) => {}
                Ok(false) => {
                    let duration = self.sleep_duration_with_jitter();
                    tokio::select! {
                        () = sleep(duration) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue, error = %e, "worker poll failed");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Run the next job on the queue, if one is due. Returns whether a job
    /// was run.
    async fn run_next_job(&self) -> Result<bool> {
        if let Err(e) = self.store.requeue_stale(self.queue, STALE_CLAIM_AFTER) {
            tracing::warn!(queue = %self.queue, error = %e, "stale claim sweep failed");
        }

        let job = match self.store.claim_next(self.queue) {
            Ok(job) => {
                self.guard.record_success();
                job
            }
            Err(e) => {
                self.guard.record_failure();
                return Err(e);
            }
        };
        let Some(job) = job else {
            return Ok(false);
        };

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        tracing::debug!(queue = %self.queue, job_id = %job.id, attempt = job.attempts, "running job");
        match self.handler.handle(&job).await {
            Ok(()) => {
                self.store.complete(&job.id)?;
                tracing::debug!(queue = %self.queue, job_id = %job.id, "job completed");
            }
            Err(JobError::Retryable(e)) => {
                self.store.fail(&job, &e.to_string())?;
            }
            Err(JobError::Fatal(e)) => {
                self.store.send_to_dlq(&job, &e.to_string())?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::jobs::MessageJob;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHandler {
        calls: AtomicU32,
        /// Fail the first N attempts with a retryable error
        fail_first: u32,
        fatal: bool,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &Job) -> JobOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal {
                return Err(JobError::Fatal(Error::Validation("bad payload".to_owned())));
            }
            if call <= self.fail_first {
                return Err(JobError::Retryable(Error::Transport("flaky".to_owned())));
            }
            Ok(())
        }
    }

    fn pipeline() -> JobPipeline {
        JobPipeline::new(JobStore::new(init_memory().unwrap()), Arc::new(BrokerGuard::new()))
    }

    fn sample_job() -> Job {
        Job::new(
            QueueKind::Message,
            "org-1",
            &MessageJob {
                instance_id: "inst-1".to_owned(),
                message_id: "wamid-1".to_owned(),
                contact_phone: "5511988887777".to_owned(),
                contact_name: None,
                content: "oi".to_owned(),
                received_at: chrono::Utc::now(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn open_guard_is_advisory_for_enqueue() {
        let pipeline = pipeline();
        for _ in 0..3 {
            pipeline.guard().record_failure();
        }
        assert!(!pipeline.guard().is_available());

        // the write still goes through; the store has the final say
        let job = sample_job();
        let job_id = pipeline.enqueue(job, None).unwrap();
        assert_eq!(
            pipeline.store().claim_next(QueueKind::Message).unwrap().unwrap().id,
            job_id
        );

        // and the successful write healed the guard
        assert!(pipeline.guard().is_available());
    }

    #[tokio::test]
    async fn absolute_schedule_in_the_past_is_ready_now() {
        let pipeline = pipeline();
        let run_at = chrono::Utc::now() - chrono::Duration::hours(1);
        pipeline.enqueue_at(sample_job(), run_at).unwrap();

        let claimed = pipeline.store().claim_next(QueueKind::Message).unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn absolute_schedule_in_the_future_is_not_ready() {
        let pipeline = pipeline();
        let run_at = chrono::Utc::now() + chrono::Duration::hours(1);
        pipeline.enqueue_at(sample_job(), run_at).unwrap();

        assert!(pipeline.store().claim_next(QueueKind::Message).unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failures_eventually_succeed() {
        let pipeline = pipeline();
        let job = sample_job();
        let job_id = pipeline.enqueue(job, None).unwrap();

        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            fatal: false,
        });

        let worker = Worker {
            store: pipeline.store().clone(),
            guard: Arc::new(BrokerGuard::new()),
            queue: QueueKind::Message,
            handler: handler.clone(),
            poll_interval: Duration::from_millis(1),
            jitter: Duration::ZERO,
            limiter: None,
            shutdown: watch::channel(false).1,
        };

        // drive the worker loop by hand: claim, fail, rewind the backoff
        for _ in 0..3 {
            if !worker.run_next_job().await.unwrap() {
                pipeline.store().rewind_backoff(&job_id);
                assert!(worker.run_next_job().await.unwrap());
            }
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(pipeline.store().dead_letters(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let pipeline = pipeline();
        pipeline.enqueue(sample_job(), None).unwrap();

        let worker = Worker {
            store: pipeline.store().clone(),
            guard: Arc::new(BrokerGuard::new()),
            queue: QueueKind::Message,
            handler: Arc::new(ScriptedHandler {
                calls: AtomicU32::new(0),
                fail_first: 0,
                fatal: true,
            }),
            poll_interval: Duration::from_millis(1),
            jitter: Duration::ZERO,
            limiter: None,
            shutdown: watch::channel(false).1,
        };
        assert!(worker.run_next_job().await.unwrap());

        let dead = pipeline.store().dead_letters(Some(QueueKind::Message)).unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("bad payload"));
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_closes_cleanly() {
        let pipeline = pipeline();
        pipeline.enqueue(sample_job(), None).unwrap();

        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: false,
        });
        let handle = start_worker(
            &pipeline,
            QueueKind::Message,
            handler.clone(),
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(5),
                jitter: Duration::ZERO,
                limiter: None,
            },
        );

        // give the pool a moment to pick the job up
        for _ in 0..50 {
            if handler.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.close().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
