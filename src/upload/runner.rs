//! Attempt runner
//!
//! Drives one upload attempt to completion against an endpoint:
//!
//! 1. Query the server for its offset (every cycle but a fresh session's first)
//! 2. Send the remaining bytes (or the next chunk)
//! 3. On a resumable failure, back off and go again from the server's offset
//!
//! Restart-classified failures are returned to the caller, which owns the
//! session and decides whether to start a new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::endpoint::UploadEndpoint;
use super::types::{ResumeProgress, TransferOutcome, UploadAttempt};
use crate::clock::Sleeper;
use crate::config::UploadConfig;
use crate::error::{Recovery, Result, UploadError};
use crate::net::ProgressSink;

/// Retry limits and backoff for a single attempt
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_resume_retries: u32,
    pub max_chunk_bytes: Option<u64>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&UploadConfig> for RunnerConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_resume_retries: config.max_resume_retries,
            max_chunk_bytes: config.max_chunk_bytes,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }
}

impl RunnerConfig {
    /// `base * 2^(retry - 1)`, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Clone)]
pub struct AttemptRunner {
    sleeper: Arc<dyn Sleeper>,
    config: RunnerConfig,
}

/// Reported progress that never goes backwards and never passes `total`
struct MonotonicProgress {
    reported: AtomicU64,
    total: u64,
    sink: Option<ProgressSink>,
}

impl MonotonicProgress {
    fn report(&self, completed: u64) {
        let completed = completed.min(self.total);
        let previous = self.reported.fetch_max(completed, Ordering::SeqCst);
        if let Some(sink) = &self.sink {
            sink(previous.max(completed), self.total);
        }
    }
}

/// A sink for a transfer starting at `offset`
fn offset_sink(progress: &Arc<MonotonicProgress>, offset: u64) -> ProgressSink {
    let progress = Arc::clone(progress);
    Arc::new(move |sent, _| progress.report(offset.saturating_add(sent)))
}

impl AttemptRunner {
    pub fn new(sleeper: Arc<dyn Sleeper>, config: RunnerConfig) -> Self {
        Self { sleeper, config }
    }

    pub async fn run(
        &self,
        endpoint: &UploadEndpoint,
        attempt: &UploadAttempt,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = attempt.total_len();
        let progress = Arc::new(MonotonicProgress {
            reported: AtomicU64::new(0),
            total,
            sink: progress,
        });

        let mut retries: u32 = 0;
        let mut offset: u64 = 0;
        let mut query_progress = attempt.is_resumed_session;
        // Offset before the last network failure, if one is being retried
        let mut failed_at: Option<u64> = None;
        // Offset a partial chunk started from; the next query must pass it
        let mut partial_from: Option<u64> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            if query_progress {
                match endpoint.get_resumable_progress(attempt).await {
                    Ok(ResumeProgress::Complete) => {
                        progress.report(total);
                        return Ok(());
                    }
                    Ok(ResumeProgress::Uploaded(n)) if n >= total => {
                        progress.report(total);
                        return Ok(());
                    }
                    Ok(ResumeProgress::Uploaded(n)) => {
                        if n != offset {
                            tracing::debug!(
                                attachment_id = %attempt.attachment_id,
                                offset = n,
                                total,
                                "Resuming upload"
                            );
                        }
                        offset = n;
                        progress.report(n);
                    }
                    Ok(ResumeProgress::Restart) => {
                        tracing::info!(attachment_id = %attempt.attachment_id, "Server asked for a restart");
                        return Err(UploadError::restart(None));
                    }
                    Err(e) if e.is_network_failure_or_timeout() => {
                        retries += 1;
                        if retries > self.config.max_resume_retries {
                            return Err(e);
                        }
                        self.backoff(attempt, retries, None, cancel).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            query_progress = true;

            if let Some(previous) = partial_from.take() {
                if offset <= previous {
                    retries += 1;
                    tracing::warn!(
                        attachment_id = %attempt.attachment_id,
                        offset,
                        retries,
                        "Chunk accepted without progress"
                    );
                    if retries > self.config.max_resume_retries {
                        return Err(UploadError::no_more_retries());
                    }
                    self.backoff(attempt, retries, None, cancel).await?;
                }
            }

            // After a network failure, only wait if the server made no progress
            if let Some(previous) = failed_at.take() {
                if offset <= previous {
                    self.backoff(attempt, retries, None, cancel).await?;
                }
            }

            let sink = offset_sink(&progress, offset);
            match endpoint
                .perform_upload(offset, attempt, self.config.max_chunk_bytes, sink)
                .await
            {
                Ok(TransferOutcome::Complete) => {
                    progress.report(total);
                    tracing::info!(
                        attachment_id = %attempt.attachment_id,
                        tier = %attempt.tier,
                        bytes = total,
                        "Upload complete"
                    );
                    return Ok(());
                }
                Ok(TransferOutcome::Partial) => partial_from = Some(offset),
                Err(e) if e.is_network_failure_or_timeout() => {
                    retries += 1;
                    tracing::warn!(
                        attachment_id = %attempt.attachment_id,
                        retries,
                        error = %e,
                        "Transfer interrupted"
                    );
                    if retries > self.config.max_resume_retries {
                        return Err(e);
                    }
                    failed_at = Some(offset);
                }
                Err(UploadError::UploadFailure {
                    recovery: Recovery::Resume(delay),
                }) => {
                    retries += 1;
                    if retries > self.config.max_resume_retries {
                        tracing::warn!(
                            attachment_id = %attempt.attachment_id,
                            retries,
                            "Resume retries exhausted"
                        );
                        return Err(UploadError::no_more_retries());
                    }
                    self.backoff(attempt, retries, delay, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(
        &self,
        attempt: &UploadAttempt,
        retries: u32,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delay = delay.unwrap_or_else(|| self.config.backoff(retries));
        tracing::debug!(
            attachment_id = %attempt.attachment_id,
            retries,
            delay_ms = delay.as_millis() as u64,
            "Backing off"
        );
        self.sleeper.sleep(delay, cancel).await
    }
}

// ============================================================================
// Tests
// ============================================================================
