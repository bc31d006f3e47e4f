//! Metadata builder
//!
//! Produces the encrypted blob an upload sends: either the attachment's own
//! file as is, a fresh re-encryption of it, or an encrypted thumbnail.
//! Everything written here is a temp file owned by the upload.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::thumbnail;
use super::types::{UploadMetadata, ValidatedUploadMetadata};
use crate::attachment::StreamInfo;
use crate::crypto::EncryptionProvider;
use crate::error::{Result, UploadError};
use crate::storage::FileSystem;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct MetadataBuilder {
    fs: Arc<dyn FileSystem>,
    encryption: Arc<dyn EncryptionProvider>,
}

impl MetadataBuilder {
    pub fn new(fs: Arc<dyn FileSystem>, encryption: Arc<dyn EncryptionProvider>) -> Self {
        Self { fs, encryption }
    }

    /// The attachment's canonical file, uploaded unchanged
    pub fn from_stream(stream: &StreamInfo) -> Result<UploadMetadata> {
        UploadMetadata::new(
            stream.encrypted_path.clone(),
            stream.encryption_key.clone(),
            stream.digest.clone(),
            stream.encrypted_len,
            stream.plaintext_len,
            false,
        )
    }

    /// Cached metadata, if its file is still on disk
    pub async fn reuse_cached(&self, cached: Option<&UploadMetadata>) -> Option<UploadMetadata> {
        let cached = cached?;
        if self.fs.exists(&cached.source_path).await {
            Some(cached.clone())
        } else {
            tracing::debug!(path = %cached.source_path.display(), "Cached upload file is gone");
            None
        }
    }

    /// Decrypt the stream and encrypt it again, under `key` or a new one
    pub async fn reencrypt(&self, stream: &StreamInfo, key: Option<&[u8]>) -> Result<UploadMetadata> {
        let plaintext = self.fs.temp_path();
        let result = async {
            self.encryption
                .decrypt_file(
                    &stream.encrypted_path,
                    &plaintext,
                    &stream.encryption_key,
                    stream.plaintext_len,
                )
                .await?;
            self.encrypt_temp(&plaintext, key).await
        }
        .await;

        self.discard(&plaintext).await;
        result
    }

    /// Decrypt the stream, render a JPEG thumbnail and encrypt it under a new key
    pub async fn thumbnail(&self, stream: &StreamInfo, max_dimension: u32) -> Result<UploadMetadata> {
        let plaintext = self.fs.temp_path();
        let thumb = self.fs.temp_path();

        let result = async {
            self.encryption
                .decrypt_file(
                    &stream.encrypted_path,
                    &plaintext,
                    &stream.encryption_key,
                    stream.plaintext_len,
                )
                .await?;

            let image_bytes = tokio::fs::read(&plaintext).await?;
            let jpeg = thumbnail::generate_thumbnail(image_bytes, max_dimension).await?;
            tokio::fs::write(&thumb, jpeg).await?;

            self.encrypt_temp(&thumb, None).await
        }
        .await;

        self.discard(&plaintext).await;
        self.discard(&thumb).await;
        result
    }

    /// Check the file's length and SHA-256 against the metadata
    pub async fn validate(&self, metadata: UploadMetadata) -> Result<ValidatedUploadMetadata> {
        let path = &metadata.source_path;
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::MissingFile(path.clone())
            } else {
                UploadError::Io(e)
            }
        })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut len: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            len += n as u64;
        }

        if len != metadata.encrypted_len || hasher.finalize().as_slice() != metadata.digest.as_slice() {
            tracing::warn!(
                path = %path.display(),
                expected_len = metadata.encrypted_len,
                actual_len = len,
                "Upload file does not match its digest"
            );
            return Err(UploadError::restart(None));
        }

        Ok(ValidatedUploadMetadata::new_unchecked(metadata))
    }

    /// Delete a temp upload file; failures are only logged
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = self.fs.delete(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete temporary upload file");
        }
    }

    async fn encrypt_temp(&self, plaintext: &Path, key: Option<&[u8]>) -> Result<UploadMetadata> {
        let dest = self.fs.temp_path();
        match self.encryption.encrypt_file(plaintext, &dest, key).await {
            Ok(encrypted) => UploadMetadata::from_encryption(dest, encrypted, true),
            Err(e) => {
                self.discard(&dest).await;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{temp_fs, write_attachment, write_blob, MockEncryption};
    use crate::upload::thumbnail::png_fixture;

    async fn builder() -> (tempfile::TempDir, MetadataBuilder) {
        let (dir, fs) = temp_fs().await;
        (dir, MetadataBuilder::new(fs, Arc::new(MockEncryption::new())))
    }

    #[tokio::test]
    async fn test_stream_metadata_is_not_temporary() {
        let (dir, _) = builder().await;
        let attachment = write_attachment(dir.path(), "a1", b"hello world").await;
        let stream = attachment.stream.unwrap();

        let metadata = MetadataBuilder::from_stream(&stream).unwrap();
        assert!(!metadata.temporary);
        assert_eq!(metadata.source_path, stream.encrypted_path);
    }

    #[tokio::test]
    async fn test_reencrypt_with_new_key() {
        let (dir, builder) = builder().await;
        let attachment = write_attachment(dir.path(), "a1", b"hello world").await;
        let stream = attachment.stream.unwrap();

        let metadata = builder.reencrypt(&stream, None).await.unwrap();
        assert!(metadata.temporary);
        assert_ne!(metadata.encryption_key, stream.encryption_key);
        assert_eq!(metadata.plaintext_len, 11);
        assert!(tokio::fs::try_exists(&metadata.source_path).await.unwrap());

        // Only the encrypted output is left in the temp dir
        let mut entries = tokio::fs::read_dir(dir.path().join("tmp")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);

        builder.validate(metadata).await.unwrap();
    }

    #[tokio::test]
    async fn test_reencrypt_keeps_requested_key() {
        let (dir, builder) = builder().await;
        let attachment = write_attachment(dir.path(), "a1", b"hello world").await;
        let stream = attachment.stream.unwrap();

        let metadata = builder
            .reencrypt(&stream, Some(&stream.encryption_key))
            .await
            .unwrap();
        assert_eq!(metadata.encryption_key, stream.encryption_key);
    }

    #[tokio::test]
    async fn test_validate_detects_tampering() {
        let (dir, builder) = builder().await;
        let metadata = write_blob(dir.path(), "blob", 200).await;
        tokio::fs::write(&metadata.source_path, vec![0u8; 200]).await.unwrap();

        let err = builder.validate(metadata).await.unwrap_err();
        assert!(err.is_restart());
    }

    #[tokio::test]
    async fn test_validate_missing_file() {
        let (dir, builder) = builder().await;
        let metadata = write_blob(dir.path(), "blob", 200).await;
        tokio::fs::remove_file(&metadata.source_path).await.unwrap();

        let err = builder.validate(metadata.clone()).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingFile(p) if p == metadata.source_path));
        assert!(builder.reuse_cached(Some(&metadata)).await.is_none());
    }

    #[tokio::test]
    async fn test_thumbnail_is_encrypted_jpeg() {
        let (dir, builder) = builder().await;
        let attachment = write_attachment(dir.path(), "a1", &png_fixture(600, 300)).await;
        let stream = attachment.stream.unwrap();

        let metadata = builder.thumbnail(&stream, 128).await.unwrap();
        assert!(metadata.temporary);
        assert_ne!(metadata.encryption_key, stream.encryption_key);

        let encrypted = tokio::fs::read(&metadata.source_path).await.unwrap();
        let jpeg = &encrypted[16..16 + metadata.plaintext_len as usize];
        assert_eq!(image::guess_format(jpeg).unwrap(), image::ImageFormat::Jpeg);
    }
}
