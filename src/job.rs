//! Archive job message contract
//!
//! The payload that travels through the broker is deliberately tiny: a single
//! link id. Attempt counts and timestamps belong to the channel that carries
//! the message, never to the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::{ArchiveError, ArtifactKind};

/// Queue that carries archive jobs.
pub const ARCHIVE_QUEUE: &str = "archive";

/// Job name attached to every archive message.
pub const ARCHIVE_JOB_NAME: &str = "archive";

/// Positive identifier of a link record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(i64);

impl LinkId {
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    /// Coerce a loosely typed value into a link id.
    ///
    /// Accepts integers, integral floats and numeric strings. Zero, negative,
    /// fractional and non-numeric values are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => {
                if let Some(id) = number.as_i64() {
                    Self::new(id)
                } else {
                    number.as_f64().and_then(Self::from_f64)
                }
            }
            Value::String(raw) => Self::parse(raw),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return Self::new(id);
        }
        raw.parse::<f64>().ok().and_then(Self::from_f64)
    }

    fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() && value.fract() == 0.0 && value > 0.0 && value < i64::MAX as f64 {
            Self::new(value as i64)
        } else {
            None
        }
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of work submitted to the queue backend: `{"linkId": <id>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveJob {
    pub link_id: LinkId,
}

impl ArchiveJob {
    pub fn new(link_id: LinkId) -> Self {
        Self { link_id }
    }

    pub fn to_payload(&self) -> Result<Value, ArchiveError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a consumed payload. Unknown fields are ignored; a missing or
    /// malformed `linkId` is rejected.
    pub fn from_payload(payload: &Value) -> Result<Self, ArchiveError> {
        let raw = payload
            .get("linkId")
            .ok_or_else(|| ArchiveError::InvalidInput("payload has no linkId".to_string()))?;

        LinkId::from_value(raw)
            .map(Self::new)
            .ok_or_else(|| ArchiveError::InvalidInput(format!("invalid linkId: {raw}")))
    }
}

/// Delay strategy between delivery attempts. Delays are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay: u64 },
    Exponential { delay: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Delivery options attached to every archive message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay: 1000 },
            remove_on_complete: true,
        }
    }
}

impl JobOptions {
    /// What happens to a job after its `attempts_made`-th failure.
    pub fn disposition(&self, attempts_made: u32) -> FailureDisposition {
        if attempts_made >= self.attempts {
            FailureDisposition::Exhausted
        } else {
            FailureDisposition::Retry {
                attempt: attempts_made + 1,
                delay: self.backoff.delay_for(attempts_made),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Redelivered as attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// No further automatic delivery.
    Exhausted,
}

/// Why a job finished without touching the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    InvalidPayload,
    LinkNotFound(LinkId),
}

/// Terminal result of a consumed job that is reported as completed.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(CaptureReport),
    Discarded(DiscardReason),
}

impl JobOutcome {
    pub fn is_discarded(&self) -> bool {
        matches!(self, JobOutcome::Discarded(_))
    }

    pub fn report(&self) -> Option<&CaptureReport> {
        match self {
            JobOutcome::Completed(report) => Some(report),
            JobOutcome::Discarded(_) => None,
        }
    }
}

/// What one pass over a link produced.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub link_id: LinkId,
    pub captured: Vec<ArtifactKind>,
    pub failed: Vec<(ArtifactKind, String)>,
    pub skipped: Vec<ArtifactKind>,
    pub persisted: bool,
    pub duration: Duration,
}

impl CaptureReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
