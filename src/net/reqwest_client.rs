//! `NetworkClient` backed by reqwest

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_util::io::ReaderStream;

use super::{HttpRequest, HttpResponse, NetworkClient, ProgressSink};
use crate::error::{Result, UploadError};

/// reqwest-based transport
#[derive(Clone)]
pub struct ReqwestNetworkClient {
    client: reqwest::Client,
}

impl ReqwestNetworkClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Unknown(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn builder(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn execute(builder: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = builder.send().await.map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_transport_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl NetworkClient for ReqwestNetworkClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.builder(&request);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        Self::execute(builder).await
    }

    async fn upload_file(
        &self,
        request: HttpRequest,
        file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<HttpResponse> {
        let handle = tokio::fs::File::open(file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::MissingFile(file.to_path_buf())
            } else {
                UploadError::Io(e)
            }
        })?;
        let total = handle.metadata().await?.len();

        let sent = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(handle).inspect_ok(move |chunk| {
            let completed = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(completed, total);
            }
        });

        let builder = self
            .builder(&request)
            .body(reqwest::Body::wrap_stream(stream));

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            bytes = total,
            "Uploading file"
        );
        Self::execute(builder).await
    }
}

fn map_transport_error(error: reqwest::Error) -> UploadError {
    if error.is_timeout() {
        UploadError::NetworkTimeout
    } else if error.is_builder() {
        UploadError::InvalidUploadUrl(error.to_string())
    } else {
        UploadError::NetworkFailure(error.to_string())
    }
}
