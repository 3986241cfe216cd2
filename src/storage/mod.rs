//! On-disk media used as encoder input.
//!
//! Uploads land in a staging directory first and are only moved into the
//! uploads directory once the submission has been accepted, so a rejected
//! request never leaves anything behind in the uploads area.

use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::errors::{AppError, AppResult};
use crate::models::UploadedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    fn file_prefix(&self) -> &'static str {
        match self {
            Self::Video => "streaming_videodata_",
            Self::Audio => "streaming_audiodata_",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaStorage {
    uploads_dir: PathBuf,
    staging_dir: PathBuf,
}

impl MediaStorage {
    pub fn new(uploads_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            uploads_dir,
            staging_dir,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.uploads_path.clone(), config.staging_path.clone())
    }

    pub async fn ensure_storage_dirs(&self) -> Result<(), std::io::Error> {
        if !self.uploads_dir.exists() {
            fs::create_dir_all(&self.uploads_dir).await?;
        }
        if !self.staging_dir.exists() {
            fs::create_dir_all(&self.staging_dir).await?;
        }
        Ok(())
    }

    /// Write a streamed upload body to a fresh staging file.
    pub async fn stage_upload<S, B, E>(&self, original_name: &str, body: S) -> AppResult<UploadedFile>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        self.ensure_storage_dirs().await?;

        let staged_path = self
            .staging_dir
            .join(format!("upload_{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&staged_path).await?;
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    self.delete(&staged_path).await;
                    return Err(AppError::validation(format!(
                        "Upload of {original_name} was interrupted: {e}"
                    )));
                }
            };
            file.write_all(chunk.as_ref()).await?;
        }
        file.flush().await?;

        debug!("Staged upload {} at {}", original_name, staged_path.display());

        Ok(UploadedFile {
            original_name: original_name.to_string(),
            staged_path,
        })
    }

    /// Move a staged upload into the uploads directory under a generated
    /// name and return that name.
    pub async fn persist(&self, staged: &UploadedFile, kind: MediaKind) -> AppResult<String> {
        self.ensure_storage_dirs().await?;

        let file_name = format!(
            "{}{}{}",
            kind.file_prefix(),
            Uuid::new_v4().simple(),
            staged.extension()
        );
        let target = self.path_for(&file_name);

        if fs::rename(&staged.staged_path, &target).await.is_err() {
            // Staging and uploads may sit on different filesystems
            fs::copy(&staged.staged_path, &target).await?;
            self.delete(&staged.staged_path).await;
        }

        Ok(file_name)
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.uploads_dir.join(file_name)
    }

    /// Best-effort removal; a missing file is not an error.
    pub async fn delete(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }

    pub async fn discard_staged(&self, staged: &UploadedFile) {
        self.delete(&staged.staged_path).await;
    }
}
