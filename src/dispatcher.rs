//! Single entry point for requesting a (re)preservation
//!
//! The backend is chosen once, when the dispatcher is built, from whether a
//! broker is configured. Callers never branch on the mode and never see an
//! error: enqueueing is fire-and-forget.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{
    connect_channel, ArchiveError, Config, LinkId, LinkStore, Metrics, PollingBackend,
    QueueBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Queue,
    Polling,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Queue => f.write_str("queue"),
            BackendKind::Polling => f.write_str("polling"),
        }
    }
}

/// Strategy behind [`JobDispatcher`].
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn enqueue(&self, link_id: LinkId) -> Result<(), ArchiveError>;
}

#[derive(Clone)]
pub struct JobDispatcher {
    backend: Arc<dyn ArchiveBackend>,
}

impl JobDispatcher {
    pub fn new(backend: Arc<dyn ArchiveBackend>) -> Self {
        Self { backend }
    }

    /// Pick the backend for the lifetime of the process.
    ///
    /// No broker selects the polling fallback. A broker URL that cannot be
    /// opened is a startup error.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn LinkStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ArchiveError> {
        let backend: Arc<dyn ArchiveBackend> = match config.broker_url.as_deref() {
            Some(url) if config.broker_configured() => {
                let channel = connect_channel(url, config).await?;
                Arc::new(QueueBackend::new(
                    channel,
                    config.job_options.clone(),
                    metrics,
                ))
            }
            _ => Arc::new(PollingBackend::new(store, metrics)),
        };

        info!(backend = %backend.kind(), "Archive dispatcher ready");
        Ok(Self::new(backend))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether the push-based backend is active.
    pub fn archive_queue_available(&self) -> bool {
        self.backend.kind() == BackendKind::Queue
    }

    pub async fn enqueue_archive_job(&self, link_id: i64) {
        match LinkId::new(link_id) {
            Some(id) => self.dispatch(id).await,
            None => debug!(link_id, "Ignoring archive request with invalid link id"),
        }
    }

    /// Same as [`Self::enqueue_archive_job`] for loosely typed input such as
    /// request parameters.
    pub async fn enqueue_archive_job_value(&self, raw: &Value) {
        match LinkId::from_value(raw) {
            Some(id) => self.dispatch(id).await,
            None => debug!(raw = %raw, "Ignoring archive request with invalid link id"),
        }
    }

    async fn dispatch(&self, link_id: LinkId) {
        match self.backend.enqueue(link_id).await {
            Ok(()) => {}
            Err(ArchiveError::NotFound(_)) => {
                info!(link_id = %link_id, "Archive request for unknown link ignored")
            }
            Err(e) => error!(
                link_id = %link_id,
                backend = %self.backend.kind(),
                "Failed to enqueue archive job: {}",
                e
            ),
        }
    }
}
