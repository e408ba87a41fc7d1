//! Top-level error types.
//!
//! Configuration errors are fatal and stop the process before any loop
//! starts. Everything else is scoped to a single message or job and is
//! absorbed at that item's boundary.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Missing or unusable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config is missing a bot token")]
    MissingToken,

    #[error("workspace {0} does not exist or is not a directory")]
    InvalidWorkspace(PathBuf),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

/// Message store and job link failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid meta.json at {path}: {source}")]
    InvalidMeta {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("invalid message key '{0}'")]
    InvalidKey(String),
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Job queue submission failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to run queue binary '{binary}': {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("queue submission exited with {status}: {stderr}")]
    Rejected { status: String, stderr: String },

    #[error("queue submission returned no job id")]
    MissingJobId,
}

/// Channel client failures.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("telegram request {method} failed: {source}")]
    Http {
        method: &'static str,
        source: reqwest::Error,
    },

    #[error("telegram {method} returned an error: {description}")]
    Api {
        method: &'static str,
        description: String,
    },

    #[error("attachment download failed: {0}")]
    Download(String),
}

/// Failures of the `dispatch` entry point. All map to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no message given; pass a message, --stdin, or --id <channel>:<id>")]
    MissingMessage,

    #[error("message is empty")]
    EmptyMessage,

    #[error("malformed id '{0}', expected <channel>:<id>")]
    MalformedId(String),

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("no prompt stored at {0}")]
    MissingPrompt(PathBuf),

    #[error("failed to run agent '{program}': {source}")]
    AgentSpawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to read stdin: {0}")]
    Stdin(std::io::Error),
}
