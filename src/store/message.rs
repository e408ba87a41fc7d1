//! Message directories and their routing metadata.

use crate::CHANNEL;
use crate::error::StoreError;
use crate::store::{JobLink, write_atomic};

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

const PROMPT_FILE: &str = "prompt.txt";
const META_FILE: &str = "meta.json";
const ATTACHMENTS_DIR: &str = "attachments";

/// Natural key of a message: `(channel, source_id)`.
///
/// `source_id` is `<chat_id>_<message_id>`. Chat ids can be negative, which
/// is why `_` separates the two parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    channel: String,
    source_id: String,
}

impl MessageKey {
    pub fn for_message(chat_id: i64, message_id: i64) -> Self {
        Self {
            channel: CHANNEL.to_string(),
            source_id: format!("{chat_id}_{message_id}"),
        }
    }

    /// Parse the `<channel>:<source_id>` form used on the dispatch command line.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        let (channel, source_id) = value
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidKey(value.to_string()))?;

        if !is_path_component(channel) || !is_path_component(source_id) {
            return Err(StoreError::InvalidKey(value.to_string()));
        }

        Ok(Self {
            channel: channel.to_string(),
            source_id: source_id.to_string(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.source_id)
    }
}

/// A single non-empty path component that can't escape its parent.
pub(crate) fn is_path_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

/// Routing metadata written to `meta.json`. Its presence marks the message
/// as committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub channel: String,
    pub chat_id: i64,
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl MessageMeta {
    pub async fn read(path: &Path) -> Result<Self, StoreError> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|error| StoreError::io("failed to read", path, error))?;
        serde_json::from_slice(&content).map_err(|source| StoreError::InvalidMeta {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn reply_target(&self) -> crate::ReplyTarget {
        crate::ReplyTarget {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }
}

/// Root of the message store.
#[derive(Debug, Clone)]
pub struct MessageStore {
    root: PathBuf,
}

impl MessageStore {
    /// Job links point at absolute paths, so a relative root is made
    /// absolute here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn message_dir(&self, key: &MessageKey) -> MessageDir {
        MessageDir {
            path: self.root.join(&key.channel).join(&key.source_id),
        }
    }

    /// Create the directory for a new message, owner-only on unix.
    ///
    /// Fails if the directory already exists, so a redelivered message is
    /// never enqueued twice.
    pub async fn create(&self, key: &MessageKey) -> Result<MessageDir, StoreError> {
        let channel_dir = self.root.join(&key.channel);
        tokio::fs::create_dir_all(&channel_dir)
            .await
            .map_err(|error| StoreError::io("failed to create", &channel_dir, error))?;

        let dir = self.message_dir(key);
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&dir.path)
            .await
            .map_err(|error| StoreError::io("failed to create", &dir.path, error))?;

        Ok(dir)
    }

    pub fn job_link(&self, job_id: &str) -> Result<JobLink, StoreError> {
        JobLink::for_job(&self.root, job_id)
    }
}

/// Handle to one message directory.
#[derive(Debug, Clone)]
pub struct MessageDir {
    path: PathBuf,
}

impl MessageDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.path.join(PROMPT_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.path.join(ATTACHMENTS_DIR)
    }

    /// Store one attachment as `attachment-<index>.<ext>` and return its path.
    pub async fn write_attachment(
        &self,
        index: usize,
        mime_type: &str,
        data: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let dir = self.attachments_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|error| StoreError::io("failed to create", &dir, error))?;

        let path = dir.join(attachment_file_name(index, mime_type));
        tokio::fs::write(&path, data)
            .await
            .map_err(|error| StoreError::io("failed to write", &path, error))?;
        Ok(path)
    }

    pub async fn write_prompt(&self, prompt: &str) -> Result<(), StoreError> {
        write_atomic(&self.prompt_path(), prompt.as_bytes()).await
    }

    pub async fn read_prompt(&self) -> Result<String, StoreError> {
        let path = self.prompt_path();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| StoreError::io("failed to read", &path, error))
    }

    pub async fn write_meta(&self, meta: &MessageMeta) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(meta).map_err(|source| StoreError::InvalidMeta {
            path: self.meta_path(),
            source,
        })?;
        write_atomic(&self.meta_path(), &json).await
    }

    /// Delete the directory and everything in it.
    pub async fn remove(&self) -> Result<(), StoreError> {
        tokio::fs::remove_dir_all(&self.path)
            .await
            .map_err(|error| StoreError::io("failed to remove", &self.path, error))
    }
}

/// Deterministic attachment file name derived from the content type.
pub(crate) fn attachment_file_name(index: usize, mime_type: &str) -> String {
    let extension = match mime_type {
        // mime_guess lists several extensions for these; pick the usual one.
        "image/jpeg" => "jpg",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "text/plain" => "txt",
        other => mime_guess::get_mime_extensions_str(other)
            .and_then(|extensions| extensions.first().copied())
            .unwrap_or("bin"),
    };
    format!("attachment-{index}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_chat_and_message_id() {
        let key = MessageKey::for_message(-100123, 45);
        assert_eq!(key.channel(), "telegram");
        assert_eq!(key.source_id(), "-100123_45");
        assert_eq!(key.to_string(), "telegram:-100123_45");
    }

    #[test]
    fn parse_round_trips_display_form() {
        let key = MessageKey::parse("telegram:12_3").expect("key should parse");
        assert_eq!(key, MessageKey::for_message(12, 3));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        for value in [
            "",
            "telegram",
            "telegram:",
            ":12_3",
            "telegram:..",
            "telegram:a/b",
            "../x:1",
        ] {
            assert!(
                MessageKey::parse(value).is_err(),
                "expected '{value}' to be rejected"
            );
        }
    }

    #[test]
    fn meta_serializes_camel_case_and_omits_missing_user() {
        let meta = MessageMeta {
            channel: "telegram".into(),
            chat_id: 10,
            message_id: 20,
            user_id: None,
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"channel": "telegram", "chatId": 10, "messageId": 20})
        );

        let meta: MessageMeta = serde_json::from_str(
            r#"{"channel":"telegram","chatId":1,"messageId":2,"userId":3}"#,
        )
        .unwrap();
        assert_eq!(meta.user_id, Some(3));
    }

    #[test]
    fn attachment_names_follow_content_type() {
        assert_eq!(attachment_file_name(1, "image/jpeg"), "attachment-1.jpg");
        assert_eq!(attachment_file_name(2, "audio/ogg"), "attachment-2.ogg");
        assert_eq!(attachment_file_name(3, "application/pdf"), "attachment-3.pdf");
        assert_eq!(
            attachment_file_name(4, "application/x-made-up"),
            "attachment-4.bin"
        );
    }

    #[tokio::test]
    async fn create_refuses_existing_directory() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = MessageStore::new(temp_dir.path());
        let key = MessageKey::for_message(1, 2);

        let dir = store.create(&key).await.expect("first create should succeed");
        assert!(dir.path().is_dir());
        assert_eq!(dir.path(), temp_dir.path().join("telegram").join("1_2"));

        let error = store.create(&key).await.expect_err("second create should fail");
        assert!(matches!(error, StoreError::Io { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_is_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;

        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = MessageStore::new(temp_dir.path());
        let dir = store
            .create(&MessageKey::for_message(1, 2))
            .await
            .expect("create should succeed");

        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn meta_read_reports_invalid_json() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = temp_dir.path().join("meta.json");
        std::fs::write(&path, "{\"chatId\": \"nope\"}").unwrap();

        let error = MessageMeta::read(&path).await.expect_err("should be invalid");
        assert!(matches!(error, StoreError::InvalidMeta { .. }));

        let missing = MessageMeta::read(&temp_dir.path().join("absent.json"))
            .await
            .expect_err("should be missing");
        assert!(missing.is_not_found());
    }
}
