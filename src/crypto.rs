//! Attachment encryption interface
//!
//! The cipher itself lives outside this crate. The upload engine only needs
//! to know the resulting key, digest and lengths.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Result of encrypting a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub key: Vec<u8>,
    /// SHA-256 over the encrypted bytes
    pub digest: Vec<u8>,
    pub encrypted_len: u64,
    pub plaintext_len: u64,
}

#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    /// Encrypt `source` into `dest`.
    ///
    /// `key` of `None` generates a fresh random key.
    async fn encrypt_file(
        &self,
        source: &Path,
        dest: &Path,
        key: Option<&[u8]>,
    ) -> Result<EncryptionMetadata>;

    /// Decrypt `source` into `dest`, truncating to `plaintext_len`.
    async fn decrypt_file(
        &self,
        source: &Path,
        dest: &Path,
        key: &[u8],
        plaintext_len: u64,
    ) -> Result<()>;
}
