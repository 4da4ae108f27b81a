use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

use crate::ArtifactKind;

#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Link {0} not found")]
    NotFound(i64),

    #[error("Rendering session unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("{kind} capture failed: {message}")]
    Capture { kind: ArtifactKind, message: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Session release failed: {0}")]
    SessionRelease(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ArchiveError {
    pub fn capture(kind: ArtifactKind, message: impl Into<String>) -> Self {
        ArchiveError::Capture {
            kind,
            message: message.into(),
        }
    }

    /// Only session acquisition and store failures consume a retry attempt.
    /// Everything else is absorbed closer to where it happens.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchiveError::ResourceUnavailable(_) | ArchiveError::Persistence(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ArchiveError::InvalidInput(_) => ErrorSeverity::Low,
            ArchiveError::NotFound(_) => ErrorSeverity::Low,
            ArchiveError::InvalidUrl(_) => ErrorSeverity::Low,
            ArchiveError::SessionRelease(_) => ErrorSeverity::Low,
            ArchiveError::Configuration(_) => ErrorSeverity::Critical,
            ArchiveError::Persistence(_) => ErrorSeverity::High,
            ArchiveError::Broker(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short label used for logs and metric dimensions.
    pub fn label(&self) -> &'static str {
        match self {
            ArchiveError::InvalidInput(_) => "invalid_input",
            ArchiveError::NotFound(_) => "not_found",
            ArchiveError::ResourceUnavailable(_) => "resource_unavailable",
            ArchiveError::Capture { .. } => "capture",
            ArchiveError::Timeout(_) => "timeout",
            ArchiveError::InvalidUrl(_) => "invalid_url",
            ArchiveError::Persistence(_) => "persistence",
            ArchiveError::Broker(_) => "broker",
            ArchiveError::SessionRelease(_) => "session_release",
            ArchiveError::Configuration(_) => "configuration",
            ArchiveError::Io(_) => "io",
            ArchiveError::Serialization(_) => "serialization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for ArchiveError {
    fn from(err: AcquireError) -> Self {
        ArchiveError::ResourceUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for ArchiveError {
    fn from(err: sqlx::Error) -> Self {
        ArchiveError::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ArchiveError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ArchiveError::Persistence(err.to_string())
    }
}
