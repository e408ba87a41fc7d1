//! Message store: one directory per inbound message, plus the job links that
//! map queue job ids back to those directories.

mod link;
mod message;

pub use link::JobLink;
pub use message::{MessageDir, MessageKey, MessageMeta, MessageStore};

use crate::error::StoreError;

use std::path::{Path, PathBuf};

/// Write `contents` to `path` through a sibling temp file and a rename, so
/// readers never observe a partial file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path: PathBuf = path.with_file_name(temp_name);

    tokio::fs::write(&temp_path, contents)
        .await
        .map_err(|error| StoreError::io("failed to write", &temp_path, error))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|error| StoreError::io("failed to rename into place", path, error))
}
