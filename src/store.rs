//! Link persistence seam
//!
//! The archiver only ever touches the preservation fields of a link, and it
//! touches them as a unit: one statement resets them, one statement commits a
//! capture pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::{ArchiveError, ArtifactSet, Link, LinkId};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Load a link with its collection owner, preferences and tags.
    async fn find_link(&self, id: LinkId) -> Result<Option<Link>, ArchiveError>;

    /// Reset every preservation field to pending. Returns `false` when no
    /// link matched.
    async fn reset_preservation(&self, id: LinkId) -> Result<bool, ArchiveError>;

    /// Write the artifacts of one pass together with `last_preserved`, a
    /// bumped `index_version` and `client_side = false`. Returns `false`
    /// when the link no longer exists.
    async fn commit_preservation(
        &self,
        id: LinkId,
        artifacts: &ArtifactSet,
        preserved_at: DateTime<Utc>,
    ) -> Result<bool, ArchiveError>;

    /// Number of links waiting for a preservation pass.
    async fn count_due(&self) -> Result<i64, ArchiveError>;
}

/// Process-local link store with the same update semantics as the database.
#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    links: DashMap<i64, Link>,
    resets: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, link: Link) {
        self.links.insert(link.id, link);
    }

    pub fn remove(&self, id: i64) -> Option<Link> {
        self.links.remove(&id).map(|(_, link)| link)
    }

    pub fn get(&self, id: i64) -> Option<Link> {
        self.links.get(&id).map(|entry| entry.value().clone())
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    /// Total number of mutating calls, whether or not a link matched.
    pub fn mutation_count(&self) -> usize {
        self.reset_count() + self.commit_count()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn find_link(&self, id: LinkId) -> Result<Option<Link>, ArchiveError> {
        Ok(self.get(id.get()))
    }

    async fn reset_preservation(&self, id: LinkId) -> Result<bool, ArchiveError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        match self.links.get_mut(&id.get()) {
            Some(mut link) => {
                link.reset_preservation();
                debug!(link_id = %id, "Reset preservation fields");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit_preservation(
        &self,
        id: LinkId,
        artifacts: &ArtifactSet,
        preserved_at: DateTime<Utc>,
    ) -> Result<bool, ArchiveError> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        match self.links.get_mut(&id.get()) {
            Some(mut link) => {
                link.commit_preservation(artifacts, preserved_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_due(&self) -> Result<i64, ArchiveError> {
        Ok(self.links.iter().filter(|entry| entry.is_due()).count() as i64)
    }
}
