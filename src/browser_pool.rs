//! Rendering session management
//!
//! A session is one headless Chrome process owned by one job for the length of
//! a capture pass. The pool bounds how many sessions exist at once; it does
//! not keep idle browsers around, so a crashed renderer never leaks into the
//! next job.

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::handler::Handler;
use chromiumoxide::page::Page;
use dashmap::DashMap;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{create_browser_config, session_user_data_dir, ArchiveError, Config};

/// Source of isolated rendering sessions.
///
/// Sessions are cheap handles; cloning one does not open a second browser.
#[async_trait]
pub trait SessionPool: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    async fn acquire(&self) -> Result<Self::Session, ArchiveError>;

    /// Tear a session down. Releasing an already released session is a no-op.
    async fn release(&self, session: Self::Session) -> Result<(), ArchiveError>;
}

/// A session scoped to one capture pass.
///
/// Call [`SessionLease::release`] on every path. A lease that is dropped
/// without it (a panic or a cancelled future) hands its session back from a
/// spawned task.
pub struct SessionLease<P: SessionPool> {
    pool: Arc<P>,
    session: P::Session,
    released: bool,
}

impl<P: SessionPool> SessionLease<P> {
    pub async fn acquire(pool: Arc<P>) -> Result<Self, ArchiveError> {
        let session = pool.acquire().await?;
        Ok(Self {
            pool,
            session,
            released: false,
        })
    }

    pub fn session(&self) -> &P::Session {
        &self.session
    }

    pub async fn release(mut self) -> Result<(), ArchiveError> {
        self.released = true;
        self.pool.release(self.session.clone()).await
    }
}

impl<P: SessionPool> Drop for SessionLease<P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pool = self.pool.clone();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = pool.release(session).await {
                        warn!("Failed to release abandoned session: {}", e);
                    }
                });
            }
            Err(_) => warn!("Session lease dropped outside the runtime, session leaked"),
        }
    }
}

struct SessionState {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    permit: Option<OwnedSemaphorePermit>,
}

struct SessionInner {
    id: String,
    user_data_dir: PathBuf,
    launched_at: Instant,
    state: RwLock<SessionState>,
}

/// Handle to one launched Chrome process.
#[derive(Clone)]
pub struct ChromeSession {
    inner: Arc<SessionInner>,
}

impl ChromeSession {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn age(&self) -> std::time::Duration {
        self.inner.launched_at.elapsed()
    }

    /// Open a new tab on `url`. Tabs of one session load concurrently; only
    /// release takes the state exclusively.
    pub async fn open_page(&self, url: &str) -> Result<Page, ArchiveError> {
        let state = self.inner.state.read().await;
        let browser = state
            .browser
            .as_ref()
            .ok_or_else(|| ArchiveError::ResourceUnavailable("session already released".to_string()))?;

        if state.handler.as_ref().map_or(true, |h| h.is_finished()) {
            return Err(ArchiveError::ResourceUnavailable(
                "browser connection lost".to_string(),
            ));
        }

        browser
            .new_page(url)
            .await
            .map_err(|e| ArchiveError::ResourceUnavailable(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPoolStats {
    pub capacity: usize,
    pub active_sessions: usize,
    pub available_permits: usize,
    pub launched: usize,
    pub released: usize,
    pub launch_failures: usize,
}

/// Launches a fresh Chrome process per acquire, at most `session_pool_size`
/// at a time.
pub struct ChromeSessionPool {
    config: Config,
    semaphore: Arc<Semaphore>,
    sessions: DashMap<String, ChromeSession>,
    is_shutting_down: AtomicBool,
    launched: AtomicUsize,
    released: AtomicUsize,
    launch_failures: AtomicUsize,
}

impl ChromeSessionPool {
    pub fn new(config: Config) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.session_pool_size)),
            config,
            sessions: DashMap::new(),
            is_shutting_down: AtomicBool::new(false),
            launched: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            launch_failures: AtomicUsize::new(0),
        }
    }

    async fn launch(&self, permit: OwnedSemaphorePermit) -> Result<ChromeSession, ArchiveError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.launch_as(id, permit).await
    }

    async fn launch_as(
        &self,
        id: String,
        permit: OwnedSemaphorePermit,
    ) -> Result<ChromeSession, ArchiveError> {
        let user_data_dir = session_user_data_dir(&id);

        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            ArchiveError::ResourceUnavailable(format!("cannot create user data dir: {e}"))
        })?;

        let (browser, mut handler) = match self.start_browser(&id).await {
            Ok(started) => started,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&user_data_dir).await {
                    debug!(session = %id, "Could not remove user data dir: {}", cleanup);
                }
                return Err(e);
            }
        };

        // The CDP handler must be polled for the browser to make progress.
        let session_id = id.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!(session = %session_id, "Browser handler error: {}", e);
                    break;
                }
            }
            debug!(session = %session_id, "Browser handler stream ended");
        });

        Ok(ChromeSession {
            inner: Arc::new(SessionInner {
                id,
                user_data_dir,
                launched_at: Instant::now(),
                state: RwLock::new(SessionState {
                    browser: Some(browser),
                    handler: Some(handler_task),
                    permit: Some(permit),
                }),
            }),
        })
    }

    async fn start_browser(
        &self,
        session_id: &str,
    ) -> Result<(Browser, Handler), ArchiveError> {
        let browser_config = create_browser_config(&self.config, session_id)?;
        let launched = timeout(self.config.launch_timeout, Browser::launch(browser_config))
            .await
            .map_err(|_| {
                ArchiveError::ResourceUnavailable(format!(
                    "browser launch timed out after {:?}",
                    self.config.launch_timeout
                ))
            })?;
        launched.map_err(|e| ArchiveError::ResourceUnavailable(e.to_string()))
    }

    pub fn stats(&self) -> SessionPoolStats {
        SessionPoolStats {
            capacity: self.config.session_pool_size,
            active_sessions: self.sessions.len(),
            available_permits: self.semaphore.available_permits(),
            launched: self.launched.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
        }
    }

    /// Refuse new sessions and close every live one.
    pub async fn shutdown(&self) {
        info!("Shutting down session pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.semaphore.close();

        let live: Vec<ChromeSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in live {
            if let Err(e) = self.release(session).await {
                warn!("Failed to close session during shutdown: {}", e);
            }
        }

        info!("Session pool shutdown complete");
    }
}

#[async_trait]
impl SessionPool for ChromeSessionPool {
    type Session = ChromeSession;

    async fn acquire(&self) -> Result<ChromeSession, ArchiveError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(ArchiveError::ResourceUnavailable(
                "session pool is shutting down".to_string(),
            ));
        }

        let permit = timeout(
            self.config.launch_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            ArchiveError::ResourceUnavailable("no rendering session became free".to_string())
        })??;

        match self.launch(permit).await {
            Ok(session) => {
                self.launched.fetch_add(1, Ordering::Relaxed);
                self.sessions
                    .insert(session.id().to_string(), session.clone());
                debug!(session = %session.id(), "Rendering session launched");
                Ok(session)
            }
            Err(e) => {
                self.launch_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to launch rendering session: {}", e);
                Err(e)
            }
        }
    }

    async fn release(&self, session: ChromeSession) -> Result<(), ArchiveError> {
        self.sessions.remove(session.id());

        let (browser, handler, permit) = {
            let mut state = session.inner.state.write().await;
            (state.browser.take(), state.handler.take(), state.permit.take())
        };

        let Some(mut browser) = browser else {
            return Ok(());
        };

        let closed = browser.close().await.map(|_| ());
        let _ = browser.wait().await;
        if let Some(handler) = handler {
            handler.abort();
        }
        drop(permit);
        self.released.fetch_add(1, Ordering::Relaxed);
        debug!(session = %session.id(), age = ?session.age(), "Rendering session closed");

        if let Err(e) = tokio::fs::remove_dir_all(&session.inner.user_data_dir).await {
            debug!(session = %session.id(), "Could not remove user data dir: {}", e);
        }

        closed.map_err(|e| ArchiveError::SessionRelease(e.to_string()))
    }
}
