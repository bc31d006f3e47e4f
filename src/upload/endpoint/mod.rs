//! CDN upload protocols
//!
//! Two wire protocols are in use, chosen by the CDN number in the upload
//! form:
//!
//! | CDN | Protocol | Session | Resume |
//! |---|---|---|---|
//! | 2 | resumable PUT | `POST` returns `Location` | `PUT` with `Content-Range` |
//! | 3 | TUS 1.0 | the form location itself | `PATCH` with `Upload-Offset` |

mod resumable_put;
mod tus;

pub use resumable_put::ResumablePutEndpoint;
pub use tus::TusEndpoint;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, HttpResponse, NetworkClient, ProgressSink};
use crate::storage::FileSystem;
use crate::upload::types::{
    ResumeProgress, TransferOutcome, UploadAttempt, UploadForm, CDN_RESUMABLE_PUT, CDN_TUS,
};

#[derive(Clone)]
pub enum UploadEndpoint {
    ResumablePut(ResumablePutEndpoint),
    Tus(TusEndpoint),
}

impl UploadEndpoint {
    /// Pick the protocol for the form's CDN
    pub fn for_form(
        form: &UploadForm,
        net: Arc<dyn NetworkClient>,
        fs: Arc<dyn FileSystem>,
        max_location_fetch_retries: u32,
    ) -> Result<Self> {
        match form.cdn_number {
            CDN_RESUMABLE_PUT => Ok(Self::ResumablePut(ResumablePutEndpoint::new(
                net,
                fs,
                max_location_fetch_retries,
            ))),
            CDN_TUS => Ok(Self::Tus(TusEndpoint::new(net, fs))),
            other => Err(UploadError::UnsupportedCdn(other)),
        }
    }

    /// Establish the URL bytes will be sent to. Never sends payload bytes.
    pub async fn fetch_resumable_location(&self, form: &UploadForm) -> Result<String> {
        match self {
            Self::ResumablePut(endpoint) => endpoint.fetch_resumable_location(form).await,
            Self::Tus(endpoint) => endpoint.fetch_resumable_location(form),
        }
    }

    /// Ask the CDN how many bytes of this session it already holds
    pub async fn get_resumable_progress(&self, attempt: &UploadAttempt) -> Result<ResumeProgress> {
        match self {
            Self::ResumablePut(endpoint) => endpoint.get_resumable_progress(attempt).await,
            Self::Tus(endpoint) => endpoint.get_resumable_progress(attempt).await,
        }
    }

    /// Send bytes from `start`, at most `max_chunk` of them when set.
    ///
    /// `progress` receives counts relative to `start`.
    pub async fn perform_upload(
        &self,
        start: u64,
        attempt: &UploadAttempt,
        max_chunk: Option<u64>,
        progress: ProgressSink,
    ) -> Result<TransferOutcome> {
        match self {
            Self::ResumablePut(endpoint) => {
                endpoint
                    .perform_upload(start, attempt, max_chunk, progress)
                    .await
            }
            Self::Tus(endpoint) => endpoint.perform_upload(start, attempt, max_chunk, progress).await,
        }
    }
}

/// End (exclusive) of the next chunk
pub(crate) fn chunk_end(start: u64, total: u64, max_chunk: Option<u64>) -> u64 {
    match max_chunk {
        Some(chunk) if chunk > 0 => start.saturating_add(chunk).min(total),
        _ => total,
    }
}

/// Numeric `Retry-After`, in seconds
pub(crate) fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Stream `[start, end)` of the attempt's file.
///
/// Anything but the whole file goes through a temporary slice, which is
/// removed afterwards.
pub(crate) async fn send_range(
    net: &dyn NetworkClient,
    fs: &dyn FileSystem,
    request: HttpRequest,
    attempt: &UploadAttempt,
    start: u64,
    end: u64,
    progress: ProgressSink,
) -> Result<HttpResponse> {
    let source: &Path = &attempt.metadata.source_path;

    if start == 0 && end == attempt.total_len() {
        return net.upload_file(request, source, Some(progress)).await;
    }

    let slice = fs.slice(source, start, end - start).await?;
    let result = net.upload_file(request, &slice, Some(progress)).await;

    if let Err(e) = fs.delete(&slice).await {
        tracing::warn!(path = %slice.display(), error = %e, "Failed to remove upload slice");
    }

    // A vanished slice says nothing about the source file
    match result {
        Err(UploadError::MissingFile(path)) if path == slice => {
            Err(UploadError::Unknown(format!("upload slice {} disappeared", path.display())))
        }
        other => other,
    }
}
