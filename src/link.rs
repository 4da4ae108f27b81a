//! Preservation-relevant projection of a link record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::LinkId;

/// One captured representation of a link's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Pdf,
    Readable,
    Monolith,
    Preview,
}

impl ArtifactKind {
    /// Kinds produced directly by a capturer, in capture order. Preview is
    /// derived from the image.
    pub const CAPTURED: [ArtifactKind; 4] = [
        ArtifactKind::Image,
        ArtifactKind::Pdf,
        ArtifactKind::Readable,
        ArtifactKind::Monolith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Readable => "readable",
            ArtifactKind::Monolith => "monolith",
            ArtifactKind::Preview => "preview",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-format archiving choices of the collection owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePreferences {
    pub screenshot: bool,
    pub pdf: bool,
    pub readable: bool,
    pub monolith: bool,
}

impl Default for ArchivePreferences {
    fn default() -> Self {
        Self {
            screenshot: true,
            pdf: true,
            readable: true,
            monolith: true,
        }
    }
}

impl ArchivePreferences {
    pub fn allows(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Image | ArtifactKind::Preview => self.screenshot,
            ArtifactKind::Pdf => self.pdf,
            ArtifactKind::Readable => self.readable,
            ArtifactKind::Monolith => self.monolith,
        }
    }
}

/// The subset of a link this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub url: Option<String>,
    pub name: String,
    pub collection_id: i64,
    pub owner_id: i64,
    pub tags: Vec<String>,
    pub preferences: ArchivePreferences,
    pub image: Option<String>,
    pub pdf: Option<String>,
    pub readable: Option<String>,
    pub monolith: Option<String>,
    pub preview: Option<String>,
    pub last_preserved: Option<DateTime<Utc>>,
    pub index_version: Option<i32>,
    pub client_side: bool,
}

impl Link {
    /// A freshly created link with every preservation field pending.
    pub fn new(id: i64, url: impl Into<String>, collection_id: i64, owner_id: i64) -> Self {
        Self {
            id,
            url: Some(url.into()),
            name: String::new(),
            collection_id,
            owner_id,
            tags: Vec::new(),
            preferences: ArchivePreferences::default(),
            image: None,
            pdf: None,
            readable: None,
            monolith: None,
            preview: None,
            last_preserved: None,
            index_version: None,
            client_side: false,
        }
    }

    pub fn link_id(&self) -> Option<LinkId> {
        LinkId::new(self.id)
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Image => self.image.as_deref(),
            ArtifactKind::Pdf => self.pdf.as_deref(),
            ArtifactKind::Readable => self.readable.as_deref(),
            ArtifactKind::Monolith => self.monolith.as_deref(),
            ArtifactKind::Preview => self.preview.as_deref(),
        }
    }

    /// Due for (re)preservation by a poller.
    pub fn is_due(&self) -> bool {
        self.last_preserved.is_none()
    }

    /// Every preservation field holds its reset value.
    pub fn is_pending(&self) -> bool {
        self.image.is_none()
            && self.pdf.is_none()
            && self.readable.is_none()
            && self.monolith.is_none()
            && self.preview.is_none()
            && self.last_preserved.is_none()
            && self.index_version.is_none()
            && !self.client_side
    }

    /// Put every preservation field back to pending.
    pub fn reset_preservation(&mut self) {
        self.image = None;
        self.pdf = None;
        self.readable = None;
        self.monolith = None;
        self.preview = None;
        self.last_preserved = None;
        self.index_version = None;
        self.client_side = false;
    }

    /// Apply one preservation pass. Fields absent from `artifacts` keep their value.
    pub fn commit_preservation(&mut self, artifacts: &ArtifactSet, preserved_at: DateTime<Utc>) {
        for (kind, path) in artifacts.iter() {
            let slot = match kind {
                ArtifactKind::Image => &mut self.image,
                ArtifactKind::Pdf => &mut self.pdf,
                ArtifactKind::Readable => &mut self.readable,
                ArtifactKind::Monolith => &mut self.monolith,
                ArtifactKind::Preview => &mut self.preview,
            };
            *slot = Some(path.to_string());
        }
        self.last_preserved = Some(preserved_at);
        self.index_version = Some(self.index_version.unwrap_or(0) + 1);
        self.client_side = false;
    }
}

/// Artifact paths produced by one pass; `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    pub image: Option<String>,
    pub pdf: Option<String>,
    pub readable: Option<String>,
    pub monolith: Option<String>,
    pub preview: Option<String>,
}

impl ArtifactSet {
    pub fn set(&mut self, kind: ArtifactKind, path: String) {
        let slot = match kind {
            ArtifactKind::Image => &mut self.image,
            ArtifactKind::Pdf => &mut self.pdf,
            ArtifactKind::Readable => &mut self.readable,
            ArtifactKind::Monolith => &mut self.monolith,
            ArtifactKind::Preview => &mut self.preview,
        };
        *slot = Some(path);
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Image => self.image.as_deref(),
            ArtifactKind::Pdf => self.pdf.as_deref(),
            ArtifactKind::Readable => self.readable.as_deref(),
            ArtifactKind::Monolith => self.monolith.as_deref(),
            ArtifactKind::Preview => self.preview.as_deref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &str)> + '_ {
        [
            ArtifactKind::Image,
            ArtifactKind::Pdf,
            ArtifactKind::Readable,
            ArtifactKind::Monolith,
            ArtifactKind::Preview,
        ]
        .into_iter()
        .filter_map(move |kind| self.get(kind).map(|path| (kind, path)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
