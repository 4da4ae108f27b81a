//! Configuration management with serde serialization/deserialization
//!
//! Configuration is layered: built-in defaults, an optional JSON file, the
//! process environment and finally command-line flags. The presence of a
//! broker URL is the one switch that selects how archive jobs are dispatched.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ArchiveError, JobOptions};

/// Environment variable holding the broker connection string.
pub const BROKER_URL_ENV: &str = "ARCHIVE_BROKER_URL";

/// Main configuration structure for the archiver
///
/// # Examples
///
/// ```rust
/// use link_archiver::Config;
///
/// let config = Config {
///     workers: 2,
///     broker_url: Some("memory://".to_string()),
///     ..Default::default()
/// };
/// assert!(config.broker_configured());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection string (default: none)
    ///
    /// When absent the archiver falls back to marking links as due instead of
    /// submitting messages. `postgres://` and `memory://` are understood.
    pub broker_url: Option<String>,

    /// Database holding link records (default: none)
    pub database_url: Option<String>,

    /// Number of concurrent worker routines consuming the archive queue
    pub workers: usize,

    /// Maximum number of rendering sessions alive at once
    pub session_pool_size: usize,

    /// Upper bound on launching one rendering session (default: 30 seconds)
    pub launch_timeout: Duration,

    /// Upper bound on capturing one artifact kind (default: 60 seconds)
    pub capture_timeout: Duration,

    /// How long an idle worker waits before polling the broker again
    pub poll_interval: Duration,

    /// Reserved jobs older than this are considered abandoned and redelivered
    pub stalled_after: Duration,

    /// Root directory for captured artifacts
    pub storage_dir: PathBuf,

    /// Which artifact kinds are captured and how
    pub capture: CaptureSettings,

    /// Browser viewport used for rendering
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for captures
    pub user_agent: Option<String>,

    /// Delivery options attached to every archive message
    pub job_options: JobOptions,

    /// Port for the Prometheus exporter; metrics are not exported when unset
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        let workers = num_cpus::get().clamp(1, 4);
        Self {
            broker_url: None,
            database_url: None,
            workers,
            session_pool_size: workers,
            launch_timeout: Duration::from_secs(30),
            capture_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            stalled_after: Duration::from_secs(600),
            storage_dir: PathBuf::from("data"),
            capture: CaptureSettings::default(),
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: None,
            job_options: JobOptions::default(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Load defaults, then the optional JSON file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ArchiveError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ArchiveError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiveError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ArchiveError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Overlay values from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty(BROKER_URL_ENV) {
            self.broker_url = Some(url);
        }
        if let Some(url) = non_empty("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(workers) = non_empty("ARCHIVE_WORKERS").and_then(|v| v.parse().ok()) {
            self.workers = workers;
        }
        if let Some(dir) = non_empty("ARCHIVE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty("CHROME_PATH") {
            self.chrome_path = Some(path);
        }
        if let Some(port) = non_empty("METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics_port = Some(port);
        }
    }

    /// Whether a broker endpoint is configured. Blank strings do not count.
    pub fn broker_configured(&self) -> bool {
        self.broker_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.workers == 0 {
            return Err(ArchiveError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.session_pool_size == 0 {
            return Err(ArchiveError::Configuration(
                "session pool size must be greater than 0".to_string(),
            ));
        }
        if self.launch_timeout.is_zero() || self.capture_timeout.is_zero() {
            return Err(ArchiveError::Configuration(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ArchiveError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if self.job_options.attempts == 0 {
            return Err(ArchiveError::Configuration(
                "job attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Artifact capture settings applied on top of each owner's preferences
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub image: bool,
    pub pdf: bool,
    pub readable: bool,
    pub monolith: bool,
    /// Derive a downscaled preview from the screenshot
    pub preview: bool,
    /// Encoding of the full-page screenshot
    pub image_format: ImageFormat,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            image: true,
            pdf: true,
            readable: true,
            monolith: true,
            preview: true,
            image_format: ImageFormat::Jpeg,
        }
    }
}

impl CaptureSettings {
    pub fn enabled(&self, kind: crate::ArtifactKind) -> bool {
        use crate::ArtifactKind;
        match kind {
            ArtifactKind::Image => self.image,
            ArtifactKind::Pdf => self.pdf,
            ArtifactKind::Readable => self.readable,
            ArtifactKind::Monolith => self.monolith,
            ArtifactKind::Preview => self.image && self.preview,
        }
    }
}

/// Browser viewport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 800)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Screenshot encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }
}

/// Chrome command-line arguments for one rendering session
///
/// Each session gets its own user-data and temp directory so concurrently
/// launched browsers never trip over Chromium's process singleton.
pub fn chrome_args(config: &Config, session_id: &str) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir={}", session_user_data_dir(session_id).display()),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn session_user_data_dir(session_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("link-archiver-{session_id}"))
}

pub fn create_browser_config(
    config: &Config,
    session_id: &str,
) -> Result<chromiumoxide::browser::BrowserConfig, ArchiveError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .launch_timeout(config.launch_timeout)
        .args(chrome_args(config, session_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(ArchiveError::ResourceUnavailable)
}
