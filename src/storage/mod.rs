//! Local file access
//!
//! Temp files for re-encrypted blobs and resume slices are created through
//! the `FileSystem` trait; the canonical attachment files are only ever read.

mod fs;

pub use fs::LocalFileSystem;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// A fresh, not yet created path inside the temp directory
    fn temp_path(&self) -> PathBuf;

    /// Copy `len` bytes of `path` starting at `offset` into a new temp file
    async fn slice(&self, path: &Path, offset: u64, len: u64) -> Result<PathBuf>;

    async fn delete(&self, path: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}
