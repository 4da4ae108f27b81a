use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::ArchiveError;

/// Handles for every archive metric.
///
/// Handles bind to the recorder installed when they are registered, so build
/// this after [`install_prometheus`]. Without a recorder every handle is a no-op.
pub struct Metrics {
    pub jobs_enqueued: Counter,
    pub jobs_completed: Counter,
    pub jobs_discarded: Counter,
    pub jobs_failed: Counter,
    pub jobs_retried: Counter,
    pub artifacts_captured: Counter,
    pub artifact_failures: Counter,
    pub session_acquire_failures: Counter,
    pub session_release_failures: Counter,
    pub active_jobs: Gauge,
    pub job_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: register_counter!("archive_jobs_enqueued_total"),
            jobs_completed: register_counter!("archive_jobs_completed_total"),
            jobs_discarded: register_counter!("archive_jobs_discarded_total"),
            jobs_failed: register_counter!("archive_jobs_failed_total"),
            jobs_retried: register_counter!("archive_jobs_retried_total"),
            artifacts_captured: register_counter!("archive_artifacts_captured_total"),
            artifact_failures: register_counter!("archive_artifact_failures_total"),
            session_acquire_failures: register_counter!("archive_session_acquire_failures_total"),
            session_release_failures: register_counter!("archive_session_release_failures_total"),
            active_jobs: register_gauge!("archive_active_jobs"),
            job_duration: register_histogram!("archive_job_duration_seconds"),
        }
    }

    pub fn record_job(&self, duration: Duration) {
        self.job_duration.record(duration.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `/metrics` in the Prometheus text format on `port`.
pub fn install_prometheus(port: u16) -> Result<(), ArchiveError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ArchiveError::Configuration(format!("cannot start metrics exporter: {e}")))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
