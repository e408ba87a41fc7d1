//! Configuration: the JSON config document and the directory layout derived
//! from the instance home.
//!
//! Both are built once at process start and handed to each component by
//! reference. Nothing below `main` reads environment variables or guesses
//! paths on its own.

use crate::error::ConfigError;

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval for the fallback rescan of terminal directories.
const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 5;

/// Agent implementations the dispatcher can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    #[default]
    Claude,
}

impl Agent {
    pub fn binary(self) -> &'static str {
        match self {
            Agent::Claude => "claude",
        }
    }

    /// Arguments passed to the agent binary for a one-shot prompt.
    pub fn args(self, prompt: &str) -> Vec<String> {
        match self {
            Agent::Claude => vec!["-p".into(), prompt.into()],
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

impl std::str::FromStr for Agent {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "claude" => Ok(Agent::Claude),
            other => Err(ConfigError::UnknownAgent(other.to_string())),
        }
    }
}

/// Raw config document as it appears on disk.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    bot_token: String,
    #[serde(default)]
    allowed_users: Vec<i64>,
    #[serde(default)]
    workspace: Option<PathBuf>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    queue_binary: Option<String>,
    #[serde(default)]
    rescan_interval_secs: Option<u64>,
}

/// Validated configuration.
#[derive(Clone)]
pub struct Config {
    pub bot_token: String,
    pub allowed_users: Vec<i64>,
    pub workspace: Option<PathBuf>,
    pub agent: Agent,
    pub queue_binary: String,
    pub rescan_interval: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"***")
            .field("allowed_users", &self.allowed_users)
            .field("workspace", &self.workspace)
            .field("agent", &self.agent)
            .field("queue_binary", &self.queue_binary)
            .field("rescan_interval", &self.rescan_interval)
            .finish()
    }
}

impl Config {
    /// Read and validate the config document at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content, path)
    }

    /// Parse and validate a config document. `path` is only used in errors.
    pub fn from_json(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let bot_token = file.bot_token.trim().to_string();
        if bot_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if let Some(workspace) = &file.workspace
            && !workspace.is_dir()
        {
            return Err(ConfigError::InvalidWorkspace(workspace.clone()));
        }

        let agent = match file.agent.as_deref() {
            Some(name) => name.parse()?,
            None => Agent::default(),
        };

        Ok(Self {
            bot_token,
            allowed_users: file.allowed_users,
            workspace: file.workspace,
            agent,
            queue_binary: file.queue_binary.unwrap_or_else(|| "nq".into()),
            rescan_interval: Duration::from_secs(
                file.rescan_interval_secs
                    .unwrap_or(DEFAULT_RESCAN_INTERVAL_SECS)
                    .max(1),
            ),
        })
    }

    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }

    /// Default instance home: `~/.courier`, or `./.courier` without a home dir.
    pub fn default_instance_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".courier")
    }
}

/// Directory layout shared by ingress, egress and dispatch. All paths are
/// derived from the instance home.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
    /// Message store root. Job links live directly under it.
    pub store: PathBuf,
    /// Queue root (`NQDIR`).
    pub queue: PathBuf,
    /// Terminal directory for jobs that exited zero (`NQDONEDIR`).
    pub done: PathBuf,
    /// Terminal directory for jobs that exited non-zero (`NQFAILDIR`).
    pub failed: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn new(home: &Path) -> Self {
        let queue = home.join("queue");
        Self {
            home: home.to_path_buf(),
            store: home.join("messages"),
            done: queue.join("done"),
            failed: queue.join("failed"),
            queue,
            log_dir: home.join("logs"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.json")
    }

    /// Create the store and queue directories if they are missing.
    pub fn ensure(&self) -> anyhow::Result<()> {
        use anyhow::Context as _;

        for dir in [&self.store, &self.queue, &self.done, &self.failed] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Environment passed to the queue so the executor writes where we watch.
    pub fn queue_env(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("NQDIR", self.queue.clone()),
            ("NQDONEDIR", self.done.clone()),
            ("NQFAILDIR", self.failed.clone()),
        ]
    }
}
