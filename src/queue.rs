//! Push-based archive backend
//!
//! `QueueBackend` turns an enqueue into one durable message on a
//! [`JobChannel`]. The channel owns delivery state: attempt counting, backoff
//! scheduling, removal of completed jobs and retention of exhausted ones.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    ArchiveBackend, ArchiveError, ArchiveJob, BackendKind, Config, FailureDisposition,
    JobOptions, LinkId, Metrics, PgJobChannel, ARCHIVE_JOB_NAME, ARCHIVE_QUEUE,
};

pub type JobId = i64;

/// A job handed to exactly one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    /// Failed attempts before this delivery.
    pub attempts_made: u32,
    pub options: JobOptions,
}

impl Delivery {
    /// Best-effort link id for log lines; the payload is validated by the worker.
    pub fn link_hint(&self) -> Option<LinkId> {
        self.payload.get("linkId").and_then(LinkId::from_value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
    pub completed: u64,
}

/// Durable at-least-once channel between enqueuers and workers.
#[async_trait]
pub trait JobChannel: Send + Sync {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: &JobOptions,
    ) -> Result<JobId, ArchiveError>;

    /// Take the earliest ready job, if any, for exclusive processing.
    async fn reserve(&self, queue: &str) -> Result<Option<Delivery>, ArchiveError>;

    async fn complete(&self, delivery: &Delivery) -> Result<(), ArchiveError>;

    /// Record a failed attempt. Non-retryable failures are exhausted at once.
    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, ArchiveError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, ArchiveError>;
}

/// Open the channel named by a broker URL.
pub async fn connect_channel(
    url: &str,
    config: &Config,
) -> Result<Arc<dyn JobChannel>, ArchiveError> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(MemoryJobChannel::new())),
        "postgres" | "postgresql" => {
            let channel = PgJobChannel::connect(url, config.stalled_after).await?;
            Ok(Arc::new(channel))
        }
        other => Err(ArchiveError::Configuration(format!(
            "unsupported broker scheme '{other}'"
        ))),
    }
}

pub struct QueueBackend {
    channel: Arc<dyn JobChannel>,
    options: JobOptions,
    metrics: Arc<Metrics>,
}

impl QueueBackend {
    pub fn new(channel: Arc<dyn JobChannel>, options: JobOptions, metrics: Arc<Metrics>) -> Self {
        Self {
            channel,
            options,
            metrics,
        }
    }

    pub fn channel(&self) -> &Arc<dyn JobChannel> {
        &self.channel
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub async fn submit(&self, job: ArchiveJob) -> Result<JobId, ArchiveError> {
        let payload = job.to_payload()?;
        let id = self
            .channel
            .push(ARCHIVE_QUEUE, ARCHIVE_JOB_NAME, payload, &self.options)
            .await?;
        self.metrics.jobs_enqueued.increment(1);
        debug!(job_id = id, link_id = %job.link_id, "Submitted archive job");
        Ok(id)
    }
}

#[async_trait]
impl ArchiveBackend for QueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Queue
    }

    async fn enqueue(&self, link_id: LinkId) -> Result<(), ArchiveError> {
        self.submit(ArchiveJob::new(link_id)).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: JobId,
    queue: String,
    name: String,
    payload: Value,
    options: JobOptions,
    attempts_made: u32,
    ready_at: Instant,
    last_error: Option<String>,
}

impl StoredJob {
    fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            queue: self.queue.clone(),
            name: self.name.clone(),
            payload: self.payload.clone(),
            attempts_made: self.attempts_made,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    next_id: JobId,
    waiting: VecDeque<StoredJob>,
    active: Vec<StoredJob>,
    failed: Vec<StoredJob>,
    completed: Vec<StoredJob>,
}

/// Process-local channel, used for single-process deployments and tests.
///
/// Delivery state lives in memory, so it is only as durable as the process.
#[derive(Debug, Default)]
pub struct MemoryJobChannel {
    state: Mutex<ChannelState>,
}

impl MemoryJobChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of every job not yet completed or failed, in delivery order.
    pub async fn pending_payloads(&self) -> Vec<Value> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.active.iter())
            .map(|job| job.payload.clone())
            .collect()
    }

    /// Exhausted jobs with their last error.
    pub async fn failed_jobs(&self) -> Vec<(Delivery, Option<String>)> {
        let state = self.state.lock().await;
        state
            .failed
            .iter()
            .map(|job| (job.delivery(), job.last_error.clone()))
            .collect()
    }

    /// Options attached to the waiting job with the given id.
    pub async fn options_of(&self, id: JobId) -> Option<JobOptions> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.active.iter())
            .find(|job| job.id == id)
            .map(|job| job.options.clone())
    }

    /// Make every delayed job ready now.
    pub async fn promote_delayed(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for job in state.waiting.iter_mut() {
            job.ready_at = job.ready_at.min(now);
        }
    }
}

#[async_trait]
impl JobChannel for MemoryJobChannel {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: &JobOptions,
    ) -> Result<JobId, ArchiveError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.waiting.push_back(StoredJob {
            id,
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            options: options.clone(),
            attempts_made: 0,
            ready_at: Instant::now(),
            last_error: None,
        });
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<Delivery>, ArchiveError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let position = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, job)| job.queue == queue && job.ready_at <= now)
            .min_by_key(|(_, job)| (job.ready_at, job.id))
            .map(|(index, _)| index);

        let Some(job) = position.and_then(|index| state.waiting.remove(index)) else {
            return Ok(None);
        };

        let delivery = job.delivery();
        state.active.push(job);
        Ok(Some(delivery))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), ArchiveError> {
        let mut state = self.state.lock().await;
        let position = state.active.iter().position(|job| job.id == delivery.id);
        let Some(job) = position.map(|index| state.active.remove(index)) else {
            return Err(ArchiveError::Broker(format!(
                "job {} is not active",
                delivery.id
            )));
        };

        if !job.options.remove_on_complete {
            state.completed.push(job);
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, ArchiveError> {
        let mut state = self.state.lock().await;
        let position = state.active.iter().position(|job| job.id == delivery.id);
        let Some(mut job) = position.map(|index| state.active.remove(index)) else {
            return Err(ArchiveError::Broker(format!(
                "job {} is not active",
                delivery.id
            )));
        };

        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        let disposition = if retryable {
            job.options.disposition(job.attempts_made)
        } else {
            FailureDisposition::Exhausted
        };

        match disposition {
            FailureDisposition::Retry { delay, .. } => {
                job.ready_at = Instant::now() + delay;
                state.waiting.push_back(job);
            }
            FailureDisposition::Exhausted => {
                info!(job_id = job.id, "Archive job moved to failed set");
                state.failed.push(job);
            }
        }
        Ok(disposition)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, ArchiveError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let in_queue = |job: &&StoredJob| job.queue == queue;

        Ok(QueueCounts {
            waiting: state
                .waiting
                .iter()
                .filter(in_queue)
                .filter(|job| job.ready_at <= now)
                .count() as u64,
            delayed: state
                .waiting
                .iter()
                .filter(in_queue)
                .filter(|job| job.ready_at > now)
                .count() as u64,
            active: state.active.iter().filter(in_queue).count() as u64,
            failed: state.failed.iter().filter(in_queue).count() as u64,
            completed: state.completed.iter().filter(in_queue).count() as u64,
        })
    }
}
