//! Retry bound and backoff curve for calls whose result is not ready yet.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Past this attempt the curve is pinned to the cap.
const EXPONENT_CAP_ATTEMPT: u32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of calls made before giving up (default: 10).
    pub max_attempts: u32,
    /// Scale of the curve in milliseconds (default: 100).
    pub base_ms: u64,
    /// Longest single wait in milliseconds (default: 2 minutes).
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_ms: 100,
            cap_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (1-based).
    ///
    /// `base · attempt^e`, capped; non-decreasing in `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt > EXPONENT_CAP_ATTEMPT {
            return Duration::from_millis(self.cap_ms);
        }
        let ms = f64::from(attempt).powf(std::f64::consts::E) * self.base_ms as f64;
        Duration::from_millis((ms as u64).min(self.cap_ms))
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
