//! Fallback backend for deployments without a broker
//!
//! Enqueueing degrades to "mark as due": the preservation fields are reset and
//! whatever scans for links with no `last_preserved` picks the link up later.
//! There is no job record, so the link fields are the only progress signal.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{ArchiveBackend, ArchiveError, BackendKind, LinkId, LinkStore, Metrics};

pub struct PollingBackend {
    store: Arc<dyn LinkStore>,
    metrics: Arc<Metrics>,
}

impl PollingBackend {
    pub fn new(store: Arc<dyn LinkStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl ArchiveBackend for PollingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Polling
    }

    async fn enqueue(&self, link_id: LinkId) -> Result<(), ArchiveError> {
        if self.store.reset_preservation(link_id).await? {
            self.metrics.jobs_enqueued.increment(1);
            debug!(link_id = %link_id, "Marked link as due for preservation");
            Ok(())
        } else {
            info!(link_id = %link_id, "Link not found, nothing to mark as due");
            Err(ArchiveError::NotFound(link_id.get()))
        }
    }
}
