//! In-process stand-ins for the browser collaborators

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    ArchiveError, ArchiveWorker, Artifact, ArtifactKind, ArtifactStorage, CaptureSettings,
    Capturer, Link, LinkStore, Metrics, SessionPool,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSession {
    pub id: usize,
}

/// Session pool that counts acquisitions and releases.
#[derive(Debug, Default)]
pub struct RecordingSessionPool {
    next_id: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    released_ids: Mutex<Vec<usize>>,
    fail_acquire: bool,
    fail_release: bool,
}

impl RecordingSessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquire fails as if no browser could be launched.
    pub fn failing() -> Self {
        Self {
            fail_acquire: true,
            ..Self::default()
        }
    }

    /// Every release reports an error after being counted.
    pub fn failing_release() -> Self {
        Self {
            fail_release: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn released_ids(&self) -> Vec<usize> {
        self.released_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionPool for RecordingSessionPool {
    type Session = FakeSession;

    async fn acquire(&self) -> Result<FakeSession, ArchiveError> {
        if self.fail_acquire {
            return Err(ArchiveError::ResourceUnavailable(
                "no browser available".to_string(),
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn release(&self, session: FakeSession) -> Result<(), ArchiveError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.released_ids.lock().unwrap().push(session.id);
        if self.fail_release {
            return Err(ArchiveError::SessionRelease("browser already gone".to_string()));
        }
        Ok(())
    }
}

/// Capturer with per-kind scripted failures.
#[derive(Debug, Default)]
pub struct ScriptedCapturer {
    failures: HashSet<ArtifactKind>,
    panics: HashSet<ArtifactKind>,
    calls: Mutex<Vec<ArtifactKind>>,
}

impl ScriptedCapturer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, kind: ArtifactKind) -> Self {
        self.failures.insert(kind);
        self
    }

    pub fn fail_all(mut self) -> Self {
        self.failures.extend(ArtifactKind::CAPTURED);
        self
    }

    pub fn panic_on(mut self, kind: ArtifactKind) -> Self {
        self.panics.insert(kind);
        self
    }

    pub fn calls(&self) -> Vec<ArtifactKind> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn sample_png() -> Vec<u8> {
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 20, image::Rgba([200, 10, 10, 255])));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
        .unwrap();
    bytes
}

#[async_trait]
impl Capturer for ScriptedCapturer {
    type Session = FakeSession;

    async fn capture(
        &self,
        _session: &FakeSession,
        link: &Link,
        kind: ArtifactKind,
    ) -> Result<Artifact, ArchiveError> {
        self.calls.lock().unwrap().push(kind);

        if self.panics.contains(&kind) {
            panic!("renderer crashed while capturing {kind}");
        }
        if self.failures.contains(&kind) {
            return Err(ArchiveError::capture(kind, "renderer refused the page"));
        }

        let artifact = match kind {
            ArtifactKind::Image => Artifact::new(kind, sample_png(), "png"),
            ArtifactKind::Pdf => Artifact::new(kind, b"%PDF-1.7".to_vec(), "pdf"),
            ArtifactKind::Readable => Artifact::new(
                kind,
                format!(r#"{{"title":"{}","textContent":"body"}}"#, link.name).into_bytes(),
                "json",
            ),
            ArtifactKind::Monolith => Artifact::new(kind, b"<html></html>".to_vec(), "html"),
            ArtifactKind::Preview => {
                return Err(ArchiveError::capture(kind, "preview is derived"));
            }
        };
        Ok(artifact)
    }
}

/// Fresh storage root under the system temp dir.
pub fn temp_storage() -> ArtifactStorage {
    ArtifactStorage::new(std::env::temp_dir().join(format!(
        "link-archiver-test-{}",
        uuid::Uuid::new_v4().simple()
    )))
}

pub fn test_worker(
    store: Arc<dyn LinkStore>,
    sessions: Arc<RecordingSessionPool>,
    capturer: Arc<ScriptedCapturer>,
) -> ArchiveWorker<RecordingSessionPool, ScriptedCapturer> {
    ArchiveWorker::new(
        store,
        sessions,
        capturer,
        temp_storage(),
        CaptureSettings::default(),
        Arc::new(Metrics::new()),
    )
}
