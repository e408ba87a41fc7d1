//! The `dispatch` entry point: what the queue actually runs for each job.
//!
//! Resolves a prompt (literal, stdin, or a stored message) and runs the
//! configured agent with it in the workspace. The agent's stdout and stderr
//! are inherited so they end up in the job file.

use crate::CHANNEL;
use crate::config::{Agent, Config, Paths};
use crate::error::DispatchError;
use crate::store::{MessageKey, MessageStore};

use tokio::io::{AsyncRead, AsyncReadExt as _};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, clap::Args)]
pub struct DispatchArgs {
    /// Prompt text to run.
    #[arg(conflicts_with_all = ["stdin", "id"])]
    pub message: Option<String>,

    /// Read the prompt from stdin.
    #[arg(long, conflicts_with = "id")]
    pub stdin: bool,

    /// Run the stored prompt of message `<channel>:<id>`.
    #[arg(long, value_name = "CHANNEL:ID")]
    pub id: Option<String>,
}

/// Where the prompt comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Literal(String),
    Stdin,
    Stored(MessageKey),
}

impl DispatchArgs {
    pub fn source(&self) -> Result<PromptSource, DispatchError> {
        if let Some(id) = &self.id {
            return parse_id(id).map(PromptSource::Stored);
        }
        if self.stdin {
            return Ok(PromptSource::Stdin);
        }
        match &self.message {
            Some(message) => Ok(PromptSource::Literal(message.clone())),
            None => Err(DispatchError::MissingMessage),
        }
    }
}

/// Parse `<channel>:<id>`. Only the telegram channel is known.
pub fn parse_id(value: &str) -> Result<MessageKey, DispatchError> {
    let key =
        MessageKey::parse(value).map_err(|_| DispatchError::MalformedId(value.to_string()))?;
    if key.channel() != CHANNEL {
        return Err(DispatchError::UnknownChannel(key.channel().to_string()));
    }
    Ok(key)
}

/// Load the prompt text. Empty prompts are an error.
pub async fn resolve_prompt(
    source: PromptSource,
    store: &MessageStore,
    mut stdin: impl AsyncRead + Unpin,
) -> crate::Result<String> {
    let prompt = match source {
        PromptSource::Literal(message) => message,
        PromptSource::Stdin => {
            let mut buffer = String::new();
            stdin
                .read_to_string(&mut buffer)
                .await
                .map_err(DispatchError::Stdin)?;
            buffer
        }
        PromptSource::Stored(key) => {
            let dir = store.message_dir(&key);
            match dir.read_prompt().await {
                Ok(prompt) => prompt,
                Err(error) if error.is_not_found() => {
                    return Err(DispatchError::MissingPrompt(dir.prompt_path()).into());
                }
                Err(error) => return Err(error.into()),
            }
        }
    };

    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(DispatchError::EmptyMessage.into());
    }
    Ok(prompt.to_string())
}

/// A prepared agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub workspace: Option<PathBuf>,
}

impl Invocation {
    pub fn for_agent(agent: Agent, prompt: &str, workspace: Option<&Path>) -> Self {
        Self {
            program: agent.binary().to_string(),
            args: agent.args(prompt),
            workspace: workspace.map(Path::to_path_buf),
        }
    }

    /// Run to completion with inherited stdio and return the exit code.
    /// A process killed by a signal counts as exit code 1.
    pub async fn run(&self) -> Result<i32, DispatchError> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(workspace) = &self.workspace {
            command.current_dir(workspace);
        }

        let status = command
            .status()
            .await
            .map_err(|source| DispatchError::AgentSpawn {
                program: self.program.clone(),
                source,
            })?;

        if status.code().is_none() {
            tracing::warn!(%status, program = %self.program, "agent terminated by signal");
        }
        Ok(status.code().unwrap_or(1))
    }
}

/// Resolve the prompt for `args` and run the configured agent with it.
pub async fn dispatch(args: &DispatchArgs, config: &Config, paths: &Paths) -> crate::Result<i32> {
    let source = args.source()?;
    let store = MessageStore::new(&paths.store);
    let prompt = resolve_prompt(source, &store, tokio::io::stdin()).await?;

    let invocation = Invocation::for_agent(config.agent, &prompt, config.workspace.as_deref());
    Ok(invocation.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(message: Option<&str>, stdin: bool, id: Option<&str>) -> DispatchArgs {
        DispatchArgs {
            message: message.map(str::to_string),
            stdin,
            id: id.map(str::to_string),
        }
    }

    #[test]
    fn source_prefers_id_then_stdin_then_literal() {
        assert_eq!(
            args(None, false, Some("telegram:1_2")).source().unwrap(),
            PromptSource::Stored(MessageKey::for_message(1, 2))
        );
        assert_eq!(args(None, true, None).source().unwrap(), PromptSource::Stdin);
        assert_eq!(
            args(Some("hi"), false, None).source().unwrap(),
            PromptSource::Literal("hi".into())
        );
        assert!(matches!(
            args(None, false, None).source(),
            Err(DispatchError::MissingMessage)
        ));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for value in ["", "telegram", "telegram:", ":1_2", "telegram:../x", "telegram:a/b"] {
            assert!(
                matches!(parse_id(value), Err(DispatchError::MalformedId(_))),
                "expected '{value}' to be malformed"
            );
        }
        assert!(matches!(
            parse_id("slack:1_2"),
            Err(DispatchError::UnknownChannel(channel)) if channel == "slack"
        ));
        assert_eq!(parse_id("telegram:-100_7").unwrap(), MessageKey::for_message(-100, 7));
    }

    #[tokio::test]
    async fn resolves_literal_stdin_and_stored_prompts() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = MessageStore::new(temp_dir.path());
        let key = MessageKey::for_message(3, 4);
        store
            .create(&key)
            .await
            .unwrap()
            .write_prompt("stored prompt")
            .await
            .unwrap();

        let literal = resolve_prompt(PromptSource::Literal(" hi ".into()), &store, tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(literal, "hi");

        let piped = resolve_prompt(PromptSource::Stdin, &store, &b"from stdin\n"[..])
            .await
            .unwrap();
        assert_eq!(piped, "from stdin");

        let stored = resolve_prompt(PromptSource::Stored(key), &store, tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(stored, "stored prompt");
    }

    #[tokio::test]
    async fn missing_or_empty_prompts_fail() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = MessageStore::new(temp_dir.path());

        let missing = resolve_prompt(
            PromptSource::Stored(MessageKey::for_message(9, 9)),
            &store,
            tokio::io::empty(),
        )
        .await;
        assert!(matches!(
            missing,
            Err(crate::Error::Dispatch(DispatchError::MissingPrompt(_)))
        ));

        let empty = resolve_prompt(PromptSource::Stdin, &store, &b"  \n"[..]).await;
        assert!(matches!(
            empty,
            Err(crate::Error::Dispatch(DispatchError::EmptyMessage))
        ));
    }

    #[test]
    fn claude_invocation_passes_prompt_as_argument() {
        let invocation = Invocation::for_agent(Agent::Claude, "do it", Some(Path::new("/work")));
        assert_eq!(invocation.program, "claude");
        assert_eq!(invocation.args, vec!["-p".to_string(), "do it".to_string()]);
        assert_eq!(invocation.workspace, Some(PathBuf::from("/work")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_returns_agent_exit_code_in_workspace() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let invocation = Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), "test -f marker && exit 3".into()],
            workspace: Some(temp_dir.path().to_path_buf()),
        };

        assert_eq!(invocation.run().await.unwrap(), 1);
        std::fs::write(temp_dir.path().join("marker"), "").unwrap();
        assert_eq!(invocation.run().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn run_reports_missing_agent() {
        let invocation = Invocation {
            program: "/nonexistent/agent-binary".into(),
            args: Vec::new(),
            workspace: None,
        };
        assert!(matches!(
            invocation.run().await,
            Err(DispatchError::AgentSpawn { .. })
        ));
    }
}
