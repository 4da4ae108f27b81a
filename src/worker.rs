//! Archive job execution
//!
//! [`ArchiveWorker`] runs one job: parse, resolve the link, lease a session,
//! capture every wanted kind, persist, release. [`WorkerPool`] keeps a fixed
//! number of [`ArchiveRoutine`]s pulling jobs from a [`JobChannel`].

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::{
    make_preview, ArchiveError, ArchiveJob, Artifact, ArtifactKind, ArtifactSet, ArtifactStorage,
    CaptureReport, CaptureSettings, Capturer, Config, Delivery, DiscardReason, FailureDisposition,
    JobChannel, JobId, JobOutcome, Link, LinkId, LinkStore, Metrics, SessionLease, SessionPool,
    ARCHIVE_QUEUE,
};

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Which kinds one pass will capture and which it leaves alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CapturePlan {
    kinds: Vec<ArtifactKind>,
    preview: bool,
    skipped: Vec<ArtifactKind>,
}

impl CapturePlan {
    fn for_link(settings: &CaptureSettings, link: &Link) -> Self {
        let wanted = |kind| settings.enabled(kind) && link.preferences.allows(kind);

        let mut plan = Self::default();
        for kind in ArtifactKind::CAPTURED {
            if wanted(kind) {
                plan.kinds.push(kind);
            } else {
                plan.skipped.push(kind);
            }
        }

        plan.preview = wanted(ArtifactKind::Preview) && plan.kinds.contains(&ArtifactKind::Image);
        if !plan.preview {
            plan.skipped.push(ArtifactKind::Preview);
        }
        plan
    }

    fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

pub struct ArchiveWorker<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    store: Arc<dyn LinkStore>,
    sessions: Arc<P>,
    capturer: Arc<C>,
    storage: ArtifactStorage,
    settings: CaptureSettings,
    metrics: Arc<Metrics>,
}

impl<P, C> ArchiveWorker<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    pub fn new(
        store: Arc<dyn LinkStore>,
        sessions: Arc<P>,
        capturer: Arc<C>,
        storage: ArtifactStorage,
        settings: CaptureSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            sessions,
            capturer,
            storage,
            settings,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn LinkStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one consumed job.
    ///
    /// A malformed payload or a deleted link completes as discarded. An error
    /// is returned only when the session could not be acquired or the store
    /// failed; both are retryable.
    pub async fn process(&self, payload: &Value) -> Result<JobOutcome, ArchiveError> {
        let job = match ArchiveJob::from_payload(payload) {
            Ok(job) => job,
            Err(e) => {
                debug!("Discarding archive job: {}", e);
                self.metrics.jobs_discarded.increment(1);
                return Ok(JobOutcome::Discarded(DiscardReason::InvalidPayload));
            }
        };

        let Some(link) = self.store.find_link(job.link_id).await? else {
            info!(link_id = %job.link_id, "Link no longer exists, discarding archive job");
            self.metrics.jobs_discarded.increment(1);
            return Ok(JobOutcome::Discarded(DiscardReason::LinkNotFound(job.link_id)));
        };

        let report = self.archive_link(&link).await?;
        Ok(JobOutcome::Completed(report))
    }

    /// Capture and persist one resolved link. This is also the entry point
    /// for anything that scans for due links instead of consuming messages.
    pub async fn archive_link(&self, link: &Link) -> Result<CaptureReport, ArchiveError> {
        let started = Instant::now();
        let link_id = link
            .link_id()
            .ok_or_else(|| ArchiveError::InvalidInput(format!("invalid link id {}", link.id)))?;
        let plan = CapturePlan::for_link(&self.settings, link);

        let (captured, failed, persisted) = if plan.is_empty() {
            debug!(link_id = %link_id, "Every artifact kind is disabled for this link");
            let persisted = self.persist(link_id, &ArtifactSet::default()).await?;
            (Vec::new(), Vec::new(), persisted)
        } else {
            let lease = self.lease_session(link_id).await?;
            let outcome = async {
                let (artifacts, captured, failed) =
                    self.capture_all(lease.session(), link, &plan).await;
                let persisted = self.persist(link_id, &artifacts).await?;
                Ok::<_, ArchiveError>((captured, failed, persisted))
            }
            .await;
            self.release_session(lease, link_id).await;
            outcome?
        };

        let report = CaptureReport {
            link_id,
            captured,
            failed,
            skipped: plan.skipped,
            persisted,
            duration: started.elapsed(),
        };
        debug!(
            link_id = %link_id,
            captured = report.captured.len(),
            failed = report.failed.len(),
            "Preservation pass finished"
        );
        Ok(report)
    }

    async fn persist(&self, link_id: LinkId, artifacts: &ArtifactSet) -> Result<bool, ArchiveError> {
        let persisted = self
            .store
            .commit_preservation(link_id, artifacts, Utc::now())
            .await
            .map_err(|e| {
                error!(link_id = %link_id, "Failed to save preservation results: {}", e);
                e
            })?;
        if !persisted {
            info!(link_id = %link_id, "Link was deleted before its artifacts were saved");
        }
        Ok(persisted)
    }

    async fn lease_session(&self, link_id: LinkId) -> Result<SessionLease<P>, ArchiveError> {
        SessionLease::acquire(self.sessions.clone())
            .await
            .map_err(|e| {
                self.metrics.session_acquire_failures.increment(1);
                warn!(link_id = %link_id, "Could not acquire a rendering session: {}", e);
                match e {
                    ArchiveError::ResourceUnavailable(_) => e,
                    other => ArchiveError::ResourceUnavailable(other.to_string()),
                }
            })
    }

    async fn release_session(&self, lease: SessionLease<P>, link_id: LinkId) {
        if let Err(e) = lease.release().await {
            self.metrics.session_release_failures.increment(1);
            warn!(link_id = %link_id, "Failed to release rendering session: {}", e);
        }
    }

    async fn capture_all(
        &self,
        session: &P::Session,
        link: &Link,
        plan: &CapturePlan,
    ) -> (ArtifactSet, Vec<ArtifactKind>, Vec<(ArtifactKind, String)>) {
        let results = join_all(
            plan.kinds
                .iter()
                .map(|&kind| async move { (kind, self.capture_kind(session, link, kind).await) }),
        )
        .await;

        let mut artifacts = ArtifactSet::default();
        let mut captured = Vec::new();
        let mut failed = Vec::new();
        let mut screenshot = None;

        for (kind, result) in results {
            match result {
                Ok((path, artifact)) => {
                    artifacts.set(kind, path);
                    captured.push(kind);
                    if kind == ArtifactKind::Image {
                        screenshot = Some(artifact);
                    }
                }
                Err(e) => failed.push((kind, e.to_string())),
            }
        }

        if plan.preview {
            let preview = match screenshot {
                Some(screenshot) => self.store_preview(link, &screenshot).await,
                None => Err(ArchiveError::capture(
                    ArtifactKind::Preview,
                    "no screenshot to derive from",
                )),
            };
            match preview {
                Ok(path) => {
                    artifacts.set(ArtifactKind::Preview, path);
                    captured.push(ArtifactKind::Preview);
                }
                Err(e) => failed.push((ArtifactKind::Preview, e.to_string())),
            }
        }

        self.metrics.artifacts_captured.increment(captured.len() as u64);
        self.metrics.artifact_failures.increment(failed.len() as u64);
        for (kind, reason) in &failed {
            warn!(link_id = link.id, kind = %kind, "Artifact capture failed: {}", reason);
        }

        (artifacts, captured, failed)
    }

    async fn capture_kind(
        &self,
        session: &P::Session,
        link: &Link,
        kind: ArtifactKind,
    ) -> Result<(String, Artifact), ArchiveError> {
        let artifact = AssertUnwindSafe(self.capturer.capture(session, link, kind))
            .catch_unwind()
            .await
            .map_err(|panic| {
                ArchiveError::capture(kind, format!("capturer panicked: {}", panic_message(&*panic)))
            })??;

        let path = self.storage.write(link, &artifact).await?;
        Ok((path, artifact))
    }

    async fn store_preview(&self, link: &Link, screenshot: &Artifact) -> Result<String, ArchiveError> {
        let preview = make_preview(&screenshot.bytes)?;
        self.storage.write(link, &preview).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolOptions {
    pub workers: usize,
    pub poll_interval: Duration,
}

impl WorkerPoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            poll_interval: config.poll_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub discarded_count: usize,
    pub error_count: usize,
}

/// One consumer loop: reserve a job, run it, report the result.
pub struct ArchiveRoutine<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    id: usize,
    worker: Arc<ArchiveWorker<P, C>>,
    channel: Arc<dyn JobChannel>,
    poll_interval: Duration,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    discarded_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl<P, C> Clone for ArchiveRoutine<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            worker: self.worker.clone(),
            channel: self.channel.clone(),
            poll_interval: self.poll_interval,
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            discarded_count: self.discarded_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

impl<P, C> ArchiveRoutine<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    pub fn new(
        id: usize,
        worker: Arc<ArchiveWorker<P, C>>,
        channel: Arc<dyn JobChannel>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            worker,
            channel,
            poll_interval,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            discarded_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Poll until `shutdown` flips to true or its sender goes away. A job in
    /// progress is always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting archive routine {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        while !*shutdown.borrow() {
            match self.run_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => trace!("Routine {} found no ready archive job", self.id),
                Err(e) => error!("Routine {} failed to poll the archive queue: {}", self.id, e),
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        info!("Archive routine {} stopped", self.id);
    }

    /// Run the next ready job, if there is one.
    pub async fn run_next(&self) -> Result<Option<JobId>, ArchiveError> {
        let Some(delivery) = self.channel.reserve(ARCHIVE_QUEUE).await? else {
            return Ok(None);
        };

        let metrics = self.worker.metrics().clone();
        metrics.active_jobs.increment(1.0);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.worker.process(&delivery.payload))
            .catch_unwind()
            .await;

        let reported = match result {
            Ok(Ok(outcome)) => self.report_completed(&delivery, &outcome).await,
            Ok(Err(e)) => self.report_failed(&delivery, &e.to_string(), e.is_retryable()).await,
            Err(panic) => {
                let message = format!("job panicked: {}", panic_message(&*panic));
                self.report_failed(&delivery, &message, true).await
            }
        };

        metrics.active_jobs.decrement(1.0);
        metrics.record_job(started.elapsed());
        reported.map(|_| Some(delivery.id))
    }

    fn link_label(delivery: &Delivery) -> String {
        delivery
            .link_hint()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string())
    }

    async fn report_completed(
        &self,
        delivery: &Delivery,
        outcome: &JobOutcome,
    ) -> Result<(), ArchiveError> {
        self.channel.complete(delivery).await?;

        if outcome.is_discarded() {
            self.discarded_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.processed_count.fetch_add(1, Ordering::Relaxed);
            self.worker.metrics().jobs_completed.increment(1);
        }
        info!(
            "Archive job {} for link {} completed.",
            delivery.id,
            Self::link_label(delivery)
        );
        Ok(())
    }

    async fn report_failed(
        &self,
        delivery: &Delivery,
        message: &str,
        retryable: bool,
    ) -> Result<(), ArchiveError> {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let disposition = self.channel.fail(delivery, message, retryable).await?;
        let link = Self::link_label(delivery);

        match disposition {
            FailureDisposition::Retry { attempt, delay } => {
                self.worker.metrics().jobs_retried.increment(1);
                warn!(
                    job_id = delivery.id,
                    attempt,
                    ?delay,
                    "Archive job {} for link {} failed, retry scheduled: {}",
                    delivery.id,
                    link,
                    message
                );
            }
            FailureDisposition::Exhausted => {
                self.worker.metrics().jobs_failed.increment(1);
                error!(
                    job_id = delivery.id,
                    "Archive job {} for link {} failed: {}", delivery.id, link, message
                );
            }
        }
        Ok(())
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            discarded_count: self.discarded_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-size set of archive routines sharing one worker and one channel.
pub struct WorkerPool<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    routines: Vec<ArchiveRoutine<P, C>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl<P, C> WorkerPool<P, C>
where
    P: SessionPool,
    C: Capturer<Session = P::Session>,
{
    pub fn start(
        worker: Arc<ArchiveWorker<P, C>>,
        channel: Arc<dyn JobChannel>,
        options: WorkerPoolOptions,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let routines: Vec<_> = (0..options.workers.max(1))
            .map(|id| ArchiveRoutine::new(id, worker.clone(), channel.clone(), options.poll_interval))
            .collect();

        let handles = routines
            .iter()
            .map(|routine| {
                let routine = routine.clone();
                let signal = signal.clone();
                tokio::spawn(async move { routine.run(signal).await })
            })
            .collect();

        info!("Started {} archive routines", routines.len());
        Self {
            routines,
            handles,
            shutdown,
        }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.routines.iter().map(|r| r.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.routines
            .iter()
            .map(|r| r.processed_count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_errors(&self) -> usize {
        self.routines
            .iter()
            .map(|r| r.error_count.load(Ordering::Relaxed))
            .sum()
    }

    /// Signal every routine and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Archive routine ended abnormally: {}", e);
            }
        }
        info!("Archive worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{temp_storage, RecordingSessionPool, ScriptedCapturer};
    use crate::{ArchivePreferences, MemoryLinkStore};

    #[test]
    fn test_plan_honours_settings_and_preferences() {
        let mut link = Link::new(1, "https://example.com", 1, 1);
        link.preferences = ArchivePreferences {
            monolith: false,
            ..Default::default()
        };
        let settings = CaptureSettings {
            pdf: false,
            ..Default::default()
        };

        let plan = CapturePlan::for_link(&settings, &link);
        assert_eq!(plan.kinds, vec![ArtifactKind::Image, ArtifactKind::Readable]);
        assert!(plan.preview);
        assert_eq!(plan.skipped, vec![ArtifactKind::Pdf, ArtifactKind::Monolith]);
    }

    #[test]
    fn test_plan_without_screenshot_has_no_preview() {
        let mut link = Link::new(1, "https://example.com", 1, 1);
        link.preferences.screenshot = false;

        let plan = CapturePlan::for_link(&CaptureSettings::default(), &link);
        assert!(!plan.kinds.contains(&ArtifactKind::Image));
        assert!(!plan.preview);
        assert!(plan.skipped.contains(&ArtifactKind::Preview));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[tokio::test]
    async fn test_panicking_kind_does_not_abort_siblings() {
        let store = Arc::new(MemoryLinkStore::new());
        store.insert(Link::new(8, "https://example.com", 2, 1));
        let pool = Arc::new(RecordingSessionPool::new());
        let capturer = Arc::new(ScriptedCapturer::new().panic_on(ArtifactKind::Readable));
        let worker = ArchiveWorker::new(
            store.clone(),
            pool.clone(),
            capturer,
            temp_storage(),
            CaptureSettings::default(),
            Arc::new(Metrics::new()),
        );

        let report = worker
            .archive_link(&store.get(8).unwrap())
            .await
            .unwrap();

        assert!(report.failed.iter().any(|(kind, reason)| {
            *kind == ArtifactKind::Readable && reason.contains("panicked")
        }));
        assert!(report.captured.contains(&ArtifactKind::Image));
        assert!(report.captured.contains(&ArtifactKind::Preview));
        assert_eq!(pool.released(), 1);

        let link = store.get(8).unwrap();
        assert!(link.readable.is_none());
        assert_eq!(link.preview.as_deref(), Some("archives/preview/2/8.jpeg"));
    }

    #[tokio::test]
    async fn test_failed_screenshot_fails_preview() {
        let store = Arc::new(MemoryLinkStore::new());
        store.insert(Link::new(9, "https://example.com", 2, 1));
        let capturer = Arc::new(ScriptedCapturer::new().fail(ArtifactKind::Image));
        let worker = ArchiveWorker::new(
            store.clone(),
            Arc::new(RecordingSessionPool::new()),
            capturer,
            temp_storage(),
            CaptureSettings::default(),
            Arc::new(Metrics::new()),
        );

        let report = worker.archive_link(&store.get(9).unwrap()).await.unwrap();
        let failed: Vec<_> = report.failed.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(failed, vec![ArtifactKind::Image, ArtifactKind::Preview]);
        assert!(report.persisted);
    }

    #[tokio::test]
    async fn test_nothing_wanted_skips_session() {
        let store = Arc::new(MemoryLinkStore::new());
        let mut link = Link::new(10, "https://example.com", 2, 1);
        link.preferences = ArchivePreferences {
            screenshot: false,
            pdf: false,
            readable: false,
            monolith: false,
        };
        store.insert(link.clone());
        let pool = Arc::new(RecordingSessionPool::new());
        let worker = ArchiveWorker::new(
            store.clone(),
            pool.clone(),
            Arc::new(ScriptedCapturer::new()),
            temp_storage(),
            CaptureSettings::default(),
            Arc::new(Metrics::new()),
        );

        let report = worker.archive_link(&link).await.unwrap();
        assert!(report.captured.is_empty());
        assert_eq!(report.skipped.len(), 5);
        assert_eq!(pool.acquired(), 0);
        assert_eq!(store.get(10).unwrap().index_version, Some(1));
    }
}
