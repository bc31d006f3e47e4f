//! Time sources and cancellable sleeping

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UploadError};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspend for `duration`; returns `UploadError::Cancelled` if `cancel`
    /// fires first.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
