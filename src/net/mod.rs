//! HTTP transport
//!
//! The upload engine talks to CDNs and the chat service only through the
//! `NetworkClient` trait so that endpoint logic can be exercised against
//! scripted responses.

mod reqwest_client;

pub use reqwest_client::ReqwestNetworkClient;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;

/// Progress callback: `(completed_bytes, total_bytes)`.
///
/// May be invoked from any task.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// An outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received response. Header names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport used by endpoints, form providers and the copy client
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Send a request with an in-memory body (or none).
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send a request whose body is streamed from `file`.
    ///
    /// `progress` receives cumulative bytes of this request's body only.
    /// A missing file is reported as `UploadError::MissingFile`.
    async fn upload_file(
        &self,
        request: HttpRequest,
        file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<HttpResponse>;
}
