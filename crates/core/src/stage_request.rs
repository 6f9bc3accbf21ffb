//! Stage requests issued to storage backends and pin expiry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

/// Historical fixed pin window applied on stage completion, in seconds.
pub const DEFAULT_PIN_WINDOW_SECS: u64 = 84_000;

/// Status of a single stage request row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    /// Submitted to the backend, completion not yet observed.
    StageSubmitted,
    /// Backend reported completion.
    Staged,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageSubmitted => "StageSubmitted",
            Self::Staged => "Staged",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "StageSubmitted" => Ok(Self::StageSubmitted),
            "Staged" => Ok(Self::Staged),
            other => Err(crate::Error::UnknownStageStatus(other.to_string())),
        }
    }
}

/// How the pin expiry time of a completed stage request is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PinExpiryPolicy {
    /// Completion time plus a fixed window, ignoring the requested pin length.
    FixedWindow {
        #[serde(default = "default_pin_window_secs")]
        secs: u64,
    },
    /// Completion time plus the pin length recorded when the request was
    /// submitted.
    RequestedPinLength,
}

fn default_pin_window_secs() -> u64 {
    DEFAULT_PIN_WINDOW_SECS
}

impl Default for PinExpiryPolicy {
    fn default() -> Self {
        Self::FixedWindow {
            secs: DEFAULT_PIN_WINDOW_SECS,
        }
    }
}

impl PinExpiryPolicy {
    /// Compute the pin expiry for a request completed at `completed_at`
    /// whose submitter asked for `pin_length_secs`.
    pub fn expiry(&self, completed_at: OffsetDateTime, pin_length_secs: i64) -> OffsetDateTime {
        let window = match self {
            Self::FixedWindow { secs } => Duration::seconds(i64::try_from(*secs).unwrap_or(i64::MAX)),
            Self::RequestedPinLength => Duration::seconds(pin_length_secs.max(0)),
        };
        completed_at.saturating_add(window)
    }
}
