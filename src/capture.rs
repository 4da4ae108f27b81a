//! Artifact capture against a rendering session
//!
//! Every kind renders in its own tab so a page that breaks one format cannot
//! take the others down with it.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::page::{Page, ScreenshotParams};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::{validate_url, ArchiveError, ArtifactKind, ChromeSession, Config, ImageFormat, Link};

/// Widest preview produced from a screenshot.
pub const PREVIEW_MAX_WIDTH: u32 = 1000;

const PREVIEW_QUALITY: u8 = 80;
const SCREENSHOT_QUALITY: u8 = 90;

/// Extracts the main content of the rendered page.
const READABLE_SCRIPT: &str = r#"(() => {
  const root = document.querySelector('article')
    || document.querySelector('main')
    || document.querySelector('[role="main"]')
    || document.body;
  const meta = (name) => {
    const el = document.querySelector(`meta[name="${name}"], meta[property="${name}"]`);
    return el ? el.getAttribute('content') : null;
  };
  const text = root ? root.innerText : '';
  return {
    title: document.title || '',
    byline: meta('author'),
    excerpt: meta('description') || meta('og:description') || text.slice(0, 200),
    textContent: text,
    content: root ? root.innerHTML : ''
  };
})()"#;

/// Bytes of one captured artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, bytes: Vec<u8>, extension: &'static str) -> Self {
        Self {
            kind,
            bytes,
            extension,
        }
    }
}

/// Readable form stored as `<id>_readability.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadableContent {
    pub title: String,
    pub byline: Option<String>,
    pub excerpt: Option<String>,
    pub text_content: String,
    pub content: String,
}

#[async_trait]
pub trait Capturer: Send + Sync + 'static {
    type Session: Send + Sync;

    /// Produce one artifact kind for `link`. Preview is derived by the caller.
    async fn capture(
        &self,
        session: &Self::Session,
        link: &Link,
        kind: ArtifactKind,
    ) -> Result<Artifact, ArchiveError>;
}

pub struct ChromeCapturer {
    capture_timeout: Duration,
    image_format: ImageFormat,
}

impl ChromeCapturer {
    pub fn new(config: &Config) -> Self {
        Self {
            capture_timeout: config.capture_timeout,
            image_format: config.capture.image_format,
        }
    }

    async fn render(&self, page: &Page, kind: ArtifactKind) -> Result<Artifact, ArchiveError> {
        let failed = |e: &dyn std::fmt::Display| ArchiveError::capture(kind, e.to_string());

        page.wait_for_navigation().await.map_err(|e| failed(&e))?;

        match kind {
            ArtifactKind::Image => {
                let params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build();
                let png = page.screenshot(params).await.map_err(|e| failed(&e))?;
                match self.image_format {
                    ImageFormat::Png => Ok(Artifact::new(kind, png, "png")),
                    ImageFormat::Jpeg => {
                        let decoded = image::load_from_memory(&png).map_err(|e| failed(&e))?;
                        let jpeg = encode_jpeg(&decoded, SCREENSHOT_QUALITY)
                            .map_err(|e| failed(&e))?;
                        Ok(Artifact::new(kind, jpeg, "jpeg"))
                    }
                }
            }
            ArtifactKind::Pdf => {
                let params = PrintToPdfParams {
                    print_background: Some(true),
                    ..Default::default()
                };
                let pdf = page.pdf(params).await.map_err(|e| failed(&e))?;
                Ok(Artifact::new(kind, pdf, "pdf"))
            }
            ArtifactKind::Readable => {
                let content: ReadableContent = page
                    .evaluate(READABLE_SCRIPT)
                    .await
                    .map_err(|e| failed(&e))?
                    .into_value()
                    .map_err(|e| failed(&e))?;
                let json = serde_json::to_vec(&content).map_err(|e| failed(&e))?;
                Ok(Artifact::new(kind, json, "json"))
            }
            ArtifactKind::Monolith => {
                let html = page.content().await.map_err(|e| failed(&e))?;
                Ok(Artifact::new(kind, html.into_bytes(), "html"))
            }
            ArtifactKind::Preview => Err(ArchiveError::capture(
                kind,
                "preview is derived from the screenshot",
            )),
        }
    }
}

#[async_trait]
impl Capturer for ChromeCapturer {
    type Session = ChromeSession;

    async fn capture(
        &self,
        session: &ChromeSession,
        link: &Link,
        kind: ArtifactKind,
    ) -> Result<Artifact, ArchiveError> {
        let url = validate_url(link.url.as_deref().unwrap_or_default())?;

        let attempt = async {
            let page = session
                .open_page(url.as_str())
                .await
                .map_err(|e| ArchiveError::capture(kind, e.to_string()))?;
            let result = self.render(&page, kind).await;
            let _ = page.close().await;
            result
        };

        let artifact = timeout(self.capture_timeout, attempt)
            .await
            .map_err(|_| ArchiveError::Timeout(self.capture_timeout))??;

        debug!(
            link_id = link.id,
            kind = %kind,
            bytes = artifact.bytes.len(),
            "Captured artifact"
        );
        Ok(artifact)
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut bytes = Vec::new();
    rgb.write_to(
        &mut Cursor::new(&mut bytes),
        image::ImageOutputFormat::Jpeg(quality),
    )?;
    Ok(bytes)
}

/// Downscale a screenshot into the JPEG preview shown in link listings.
pub fn make_preview(screenshot: &[u8]) -> Result<Artifact, ArchiveError> {
    let failed = |e: image::ImageError| ArchiveError::capture(ArtifactKind::Preview, e.to_string());

    let decoded = image::load_from_memory(screenshot).map_err(failed)?;
    let preview = if decoded.width() > PREVIEW_MAX_WIDTH {
        decoded.resize(PREVIEW_MAX_WIDTH, u32::MAX, FilterType::Triangle)
    } else {
        decoded
    };

    let bytes = encode_jpeg(&preview, PREVIEW_QUALITY).map_err(failed)?;
    Ok(Artifact::new(ArtifactKind::Preview, bytes, "jpeg"))
}
