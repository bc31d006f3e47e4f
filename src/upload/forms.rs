//! Upload form issuing
//!
//! Forms are short-lived signed authorizations fetched from the chat
//! service. Transit forms use the account's credentials; media forms use
//! the backup credentials passed with each request.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;

use super::types::{MediaTierAuth, UploadForm};
use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, NetworkClient};

pub const TRANSIT_FORM_PATH: &str = "/v4/attachments/form/upload";
pub const MEDIA_FORM_PATH: &str = "/v1/archives/media/upload/form";

#[async_trait]
pub trait FormProvider: Send + Sync {
    async fn transit_form(&self) -> Result<UploadForm>;

    async fn media_form(&self, auth: &MediaTierAuth) -> Result<UploadForm>;
}

/// Fetches forms from the chat service over HTTP
pub struct HttpFormProvider {
    net: Arc<dyn NetworkClient>,
    base_url: String,
    auth_headers: BTreeMap<String, String>,
}

impl HttpFormProvider {
    pub fn new(net: Arc<dyn NetworkClient>, base_url: impl Into<String>, auth_headers: BTreeMap<String, String>) -> Self {
        Self {
            net,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_headers,
        }
    }

    async fn fetch(&self, path: &str, headers: &BTreeMap<String, String>) -> Result<UploadForm> {
        let request = HttpRequest::new(Method::GET, format!("{}{}", self.base_url, path))
            .with_headers(headers)
            .with_header("Accept", "application/json");

        let response = self.net.send(request).await?;
        if !response.is_success() {
            tracing::warn!(path, status = response.status, "Upload form request failed");
            return Err(UploadError::UnexpectedStatusCode(response.status));
        }

        let form: UploadForm = serde_json::from_slice(&response.body)
            .map_err(|e| UploadError::InvalidForm(e.to_string()))?;

        if form.cdn_key.is_empty() || form.signed_upload_location.is_empty() {
            return Err(UploadError::InvalidForm("empty key or upload location".to_string()));
        }

        tracing::debug!(cdn = form.cdn_number, path, "Fetched upload form");
        Ok(form)
    }
}

#[async_trait]
impl FormProvider for HttpFormProvider {
    async fn transit_form(&self) -> Result<UploadForm> {
        self.fetch(TRANSIT_FORM_PATH, &self.auth_headers).await
    }

    async fn media_form(&self, auth: &MediaTierAuth) -> Result<UploadForm> {
        self.fetch(MEDIA_FORM_PATH, &auth.headers).await
    }
}
