//! Job links: `<store>/<job_id>.d`, a symlink to the message directory the
//! job was submitted for.
//!
//! Any process that knows the store root and a job id can find the message
//! directory, with no shared state beyond the filesystem.

use crate::error::StoreError;
use crate::store::message::is_path_component;

use std::path::{Path, PathBuf};

const LINK_SUFFIX: &str = ".d";

#[derive(Debug, Clone)]
pub struct JobLink {
    path: PathBuf,
}

impl JobLink {
    pub fn for_job(store_root: &Path, job_id: &str) -> Result<Self, StoreError> {
        if !is_path_component(job_id) {
            return Err(StoreError::InvalidJobId(job_id.to_string()));
        }
        Ok(Self {
            path: store_root.join(format!("{job_id}{LINK_SUFFIX}")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `meta.json` of the linked message directory, reached through the link.
    pub fn meta_path(&self) -> PathBuf {
        self.path.join("meta.json")
    }

    pub async fn create(&self, target: &Path) -> Result<(), StoreError> {
        #[cfg(unix)]
        let result = tokio::fs::symlink(target, &self.path).await;
        #[cfg(windows)]
        let result = tokio::fs::symlink_dir(target, &self.path).await;

        result.map_err(|error| StoreError::io("failed to create job link", &self.path, error))
    }

    /// The message directory this link leads to: the symlink target, or
    /// the path itself when an older layout left a real directory there.
    pub async fn message_dir(&self) -> Result<PathBuf, StoreError> {
        let metadata = tokio::fs::symlink_metadata(&self.path)
            .await
            .map_err(|error| StoreError::io("failed to stat job link", &self.path, error))?;

        if metadata.is_dir() {
            return Ok(self.path.clone());
        }
        if !metadata.file_type().is_symlink() {
            return Err(StoreError::io(
                "job link is neither a symlink nor a directory",
                &self.path,
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }

        let target = tokio::fs::read_link(&self.path)
            .await
            .map_err(|error| StoreError::io("failed to read job link", &self.path, error))?;

        if target.is_absolute() {
            Ok(target)
        } else {
            let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
            Ok(parent.join(target))
        }
    }

    /// Remove the link if it exists and is a symlink. Anything else at that
    /// path (a directory or file left by something else) is left untouched.
    ///
    /// Returns whether a link was removed.
    pub async fn remove_if_symlink(&self) -> Result<bool, StoreError> {
        let metadata = match tokio::fs::symlink_metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(StoreError::io("failed to stat job link", &self.path, error));
            }
        };

        if !metadata.file_type().is_symlink() {
            tracing::warn!(path = %self.path.display(), "job link path is not a symlink, leaving it");
            return Ok(false);
        }

        #[cfg(unix)]
        let result = tokio::fs::remove_file(&self.path).await;
        #[cfg(windows)]
        let result = tokio::fs::remove_dir(&self.path).await;

        result.map_err(|error| StoreError::io("failed to remove job link", &self.path, error))?;
        Ok(true)
    }
}
