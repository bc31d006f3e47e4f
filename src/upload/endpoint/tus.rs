//! TUS 1.0 protocol (CDN 3)

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Method;

use super::{chunk_end, retry_after, send_range};
use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, NetworkClient, ProgressSink};
use crate::storage::FileSystem;
use crate::upload::types::{
    ResumeProgress, TransferOutcome, UploadAttempt, UploadForm, CHECKSUM_HEADER, TUS_VERSION,
};

const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

#[derive(Clone)]
pub struct TusEndpoint {
    net: Arc<dyn NetworkClient>,
    fs: Arc<dyn FileSystem>,
}

impl TusEndpoint {
    pub fn new(net: Arc<dyn NetworkClient>, fs: Arc<dyn FileSystem>) -> Self {
        Self { net, fs }
    }

    /// The signed location is the creation endpoint; nothing to fetch
    pub fn fetch_resumable_location(&self, form: &UploadForm) -> Result<String> {
        reqwest::Url::parse(&form.signed_upload_location)
            .map_err(|e| UploadError::InvalidUploadUrl(format!("{}: {}", form.signed_upload_location, e)))?;
        Ok(form.signed_upload_location.clone())
    }

    fn upload_url(attempt: &UploadAttempt) -> String {
        format!(
            "{}/{}",
            attempt.location.trim_end_matches('/'),
            urlencoding::encode(&attempt.form.cdn_key)
        )
    }

    pub async fn get_resumable_progress(&self, attempt: &UploadAttempt) -> Result<ResumeProgress> {
        let request = HttpRequest::new(Method::HEAD, Self::upload_url(attempt))
            .with_headers(&attempt.form.headers)
            .with_header("Tus-Resumable", TUS_VERSION);

        let response = self.net.send(request).await?;

        match response.status {
            // Session is gone; start over at zero within the same form
            403 | 404 | 410 => Ok(ResumeProgress::Uploaded(0)),
            200 => match response.header("upload-offset") {
                None => Ok(ResumeProgress::Restart),
                Some(offset) => Ok(offset
                    .trim()
                    .parse::<u64>()
                    .map(ResumeProgress::Uploaded)
                    .unwrap_or(ResumeProgress::Uploaded(0))),
            },
            status => {
                tracing::warn!(status, "Unexpected TUS HEAD response, restarting");
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

        let request = if start == 0 {
            HttpRequest::new(Method::POST, &attempt.location)
                .with_headers(&attempt.form.headers)
                .with_header("Upload-Length", total.to_string())
                .with_header(CHECKSUM_HEADER, BASE64.encode(&attempt.metadata.digest))
        } else {
            HttpRequest::new(Method::PATCH, Self::upload_url(attempt))
                .with_headers(&attempt.form.headers)
                .with_header("Upload-Offset", start.to_string())
        };
        let request = request
            .with_header("Tus-Resumable", TUS_VERSION)
            .with_header("Content-Type", OFFSET_CONTENT_TYPE)
            .with_header("Content-Length", (end - start).to_string());

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
            200..=204 if end < total => Ok(TransferOutcome::Partial),
            200..=204 => Ok(TransferOutcome::Complete),
            415 => {
                tracing::warn!(attachment_id = %attempt.attachment_id, "Checksum mismatch, restarting");
                Err(UploadError::restart(retry_after(&response)))
            }
            status @ 400..=499 => {
                tracing::warn!(status, attachment_id = %attempt.attachment_id, "Upload rejected");
                Err(UploadError::restart(retry_after(&response)))
            }
            status if status >= 500 => Err(UploadError::resume(retry_after(&response))),
            status => Err(UploadError::UnexpectedStatusCode(status)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
