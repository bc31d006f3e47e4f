//! Resumable-PUT protocol (CDN 2)

use std::sync::Arc;

use reqwest::Method;

use super::{chunk_end, retry_after, send_range};
use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, NetworkClient, ProgressSink};
use crate::storage::FileSystem;
use crate::upload::types::{ResumeProgress, TransferOutcome, UploadAttempt, UploadForm};

#[derive(Clone)]
pub struct ResumablePutEndpoint {
    net: Arc<dyn NetworkClient>,
    fs: Arc<dyn FileSystem>,
    max_location_fetch_retries: u32,
}

impl ResumablePutEndpoint {
    pub fn new(net: Arc<dyn NetworkClient>, fs: Arc<dyn FileSystem>, max_location_fetch_retries: u32) -> Self {
        Self {
            net,
            fs,
            max_location_fetch_retries,
        }
    }

    /// Open a session: `POST` the signed location, read `Location` from the 201
    pub async fn fetch_resumable_location(&self, form: &UploadForm) -> Result<String> {
        let mut failures = 0;

        loop {
            let request = HttpRequest::new(Method::POST, &form.signed_upload_location)
                .with_headers(&form.headers)
                .with_header("Content-Length", "0")
                .with_header("Content-Type", "application/octet-stream");

            let response = match self.net.send(request).await {
                Ok(response) => response,
                Err(e) if e.is_network_failure_or_timeout() && failures < self.max_location_fetch_retries => {
                    failures += 1;
                    tracing::warn!(failures, error = %e, "Session creation failed, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.status != 201 {
                return Err(UploadError::UnexpectedStatusCode(response.status));
            }

            let location = response
                .header("location")
                .ok_or_else(|| UploadError::InvalidUploadUrl("missing Location header".to_string()))?;

            reqwest::Url::parse(location)
                .map_err(|e| UploadError::InvalidUploadUrl(format!("{}: {}", location, e)))?;

            tracing::debug!(location = %location, "Created resumable session");
            return Ok(location.to_string());
        }
    }

    /// `PUT` an empty body with `Content-Range: bytes */total`
    pub async fn get_resumable_progress(&self, attempt: &UploadAttempt) -> Result<ResumeProgress> {
        let total = attempt.total_len();
        let request = HttpRequest::new(Method::PUT, &attempt.location)
            .with_header("Content-Length", "0")
            .with_header("Content-Range", format!("bytes */{}", total))
            .with_body(Vec::new());

        let response = self.net.send(request).await?;

        match response.status {
            200 | 201 => Ok(ResumeProgress::Complete),
            308 => Ok(parse_range(response.header("range"))),
            status => {
                tracing::warn!(status, "Unexpected progress response, restarting");
                Ok(ResumeProgress::Restart)
            }
        }
    }

    pub async fn perform_upload(
        &self,
        start: u64,
        attempt: &UploadAttempt,
        max_chunk: Option<u64>,
        progress: ProgressSink,
    ) -> Result<TransferOutcome> {
        let total = attempt.total_len();
        let end = chunk_end(start, total, max_chunk);

        let mut request = HttpRequest::new(Method::PUT, &attempt.location)
            .with_header("Content-Length", (end - start).to_string());
        if start > 0 || end < total {
            request = request.with_header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, total));
        }

        let response = send_range(
            self.net.as_ref(),
            self.fs.as_ref(),
            request,
            attempt,
            start,
            end,
            progress,
        )
        .await?;

        match response.status {
            200 | 201 => Ok(TransferOutcome::Complete),
            308 if end < total => Ok(TransferOutcome::Partial),
            // Server kept some of the final chunk; find out how much
            308 => Err(UploadError::resume(None)),
            status if status >= 500 => Err(UploadError::resume(retry_after(&response))),
            status => {
                tracing::warn!(status, attachment_id = %attempt.attachment_id, "Upload rejected");
                Err(UploadError::restart(retry_after(&response)))
            }
        }
    }
}

/// Bytes accepted according to a `Range: bytes=0-<end>` header
fn parse_range(header: Option<&str>) -> ResumeProgress {
    let Some(range) = header.and_then(|h| h.strip_prefix("bytes=0-")) else {
        // Nothing stored yet
        return ResumeProgress::Uploaded(0);
    };

    match range.trim().parse::<u64>() {
        Ok(end) => end
            .checked_add(1)
            .map_or(ResumeProgress::Restart, ResumeProgress::Uploaded),
        Err(_) => ResumeProgress::Restart,
    }
}

// ============================================================================
// Tests
// ============================================================================
