//! On-disk layout of captured artifacts
//!
//! Paths stored on the link are relative to the storage root:
//! `archives/<collection>/<link>.<ext>` for most kinds,
//! `archives/<collection>/<link>_readability.json` for readable content and
//! `archives/preview/<collection>/<link>.jpeg` for previews.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{ArchiveError, Artifact, ArtifactKind, Link};

#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(link: &Link, artifact: &Artifact) -> String {
        let collection = link.collection_id;
        let id = link.id;
        match artifact.kind {
            ArtifactKind::Preview => {
                format!("archives/preview/{collection}/{id}.{}", artifact.extension)
            }
            ArtifactKind::Readable => format!("archives/{collection}/{id}_readability.json"),
            _ => format!("archives/{collection}/{id}.{}", artifact.extension),
        }
    }

    /// Write the artifact and return the path to persist on the link.
    pub async fn write(&self, link: &Link, artifact: &Artifact) -> Result<String, ArchiveError> {
        let relative = Self::relative_path(link, artifact);
        let target = self.root.join(&relative);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &artifact.bytes).await?;

        debug!(link_id = link.id, kind = %artifact.kind, path = %relative, "Stored artifact");
        Ok(relative)
    }
}
