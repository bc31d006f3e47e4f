//! tokio::fs backed `FileSystem`

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::FileSystem;
use crate::error::{Result, UploadError};

/// Filesystem rooted at a temp directory
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    temp_dir: PathBuf,
}

impl LocalFileSystem {
    /// Create the filesystem, making sure the temp directory exists
    pub async fn new(temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let temp_dir = temp_dir.into();
        fs::create_dir_all(&temp_dir).await?;
        Ok(Self { temp_dir })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

fn not_found_as_missing(path: &Path) -> impl FnOnce(std::io::Error) -> UploadError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            UploadError::MissingFile(path.to_path_buf())
        } else {
            UploadError::Io(e)
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn temp_path(&self) -> PathBuf {
        self.temp_dir.join(Uuid::new_v4().to_string())
    }

    async fn slice(&self, path: &Path, offset: u64, len: u64) -> Result<PathBuf> {
        let mut source = fs::File::open(path).await.map_err(not_found_as_missing(path))?;
        source.seek(SeekFrom::Start(offset)).await?;

        let dest_path = self.temp_path();
        let mut dest = fs::File::create(&dest_path).await?;

        let copied = tokio::io::copy(&mut source.take(len), &mut dest).await?;
        dest.flush().await?;

        if copied != len {
            let _ = fs::remove_file(&dest_path).await;
            return Err(UploadError::Unknown(format!(
                "Short read slicing {}: wanted {} bytes at {}, got {}",
                path.display(),
                len,
                offset,
                copied
            )));
        }

        tracing::debug!(path = %path.display(), offset, len, "Sliced file");
        Ok(dest_path)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================
