//! # Link Archiver
//!
//! Archive-job orchestration for saved links. A request to (re)preserve a link
//! goes through one [`JobDispatcher`], which was bound at startup to one of
//! two backends:
//!
//! | Broker configured | Backend | Effect of an enqueue |
//! |-------------------|---------|----------------------|
//! | yes | [`QueueBackend`] | one `{"linkId": id}` message, 3 attempts, exponential backoff from 1 s |
//! | no | [`PollingBackend`] | the link's preservation fields are reset so a poller picks it up |
//!
//! Consumed jobs run through [`ArchiveWorker`]: resolve the link, lease a
//! headless Chrome session, capture image, pdf, readable and monolith forms
//! independently, persist whatever succeeded in one update and release the
//! session on every path. Only session and store failures are retried.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use link_archiver::{Config, JobDispatcher, Metrics, PgLinkStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let store = Arc::new(PgLinkStore::connect("postgres://localhost/links").await?);
//!     let dispatcher = JobDispatcher::from_config(&config, store, Arc::new(Metrics::new())).await?;
//!
//!     dispatcher.enqueue_archive_job(42).await;
//!     println!("queue available: {}", dispatcher.archive_queue_available());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # Consume archive jobs until SIGINT/SIGTERM
//! ARCHIVE_BROKER_URL=postgres://localhost/links link-archiver worker
//!
//! # Request preservation of two links
//! link-archiver enqueue 42 43
//!
//! # Queue counts and number of due links
//! link-archiver status
//! ```

/// Configuration and settings for the archiver
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Archive job message contract
pub mod job;

/// Preservation fields of a link
pub mod link;

/// Link persistence seam
pub mod store;

/// Durable job channel and the push-based backend
pub mod queue;

/// Fallback backend that marks links as due
pub mod polling;

/// Backend selection and the enqueue entry point
pub mod dispatcher;

/// PostgreSQL link store and job channel
pub mod postgres;

/// Rendering session management
pub mod browser_pool;

/// Artifact capture against a rendering session
pub mod capture;

/// Artifact files on disk
pub mod storage;

/// Job execution and the consumer pool
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Archive metrics and the Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;

pub use browser_pool::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use job::*;
pub use link::*;
pub use metrics::*;
pub use polling::*;
pub use postgres::*;
pub use queue::*;
pub use storage::*;
pub use store::*;
pub use utils::*;
pub use worker::*;
