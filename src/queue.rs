//! External job queue.
//!
//! The queue runs a command, captures its output into a job file and moves
//! that file into a terminal directory when the command exits. We only
//! submit jobs and read the resulting files.

use crate::config::Paths;
use crate::error::QueueError;

use std::future::Future;
use std::path::PathBuf;

/// Submission side of the external queue.
pub trait JobQueue: Send + Sync + 'static {
    /// Submit `argv` as one job and return the id the queue assigned to it.
    fn submit(&self, argv: &[String]) -> impl Future<Output = Result<String, QueueError>> + Send;
}

/// `nq`-compatible queue driven through its command line.
#[derive(Debug, Clone)]
pub struct NqQueue {
    binary: String,
    env: Vec<(&'static str, PathBuf)>,
}

impl NqQueue {
    pub fn new(binary: impl Into<String>, paths: &Paths) -> Self {
        Self {
            binary: binary.into(),
            env: paths.queue_env(),
        }
    }
}

impl JobQueue for NqQueue {
    async fn submit(&self, argv: &[String]) -> Result<String, QueueError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(argv)
            .envs(self.env.iter().map(|(key, value)| (*key, value)))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| QueueError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(QueueError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }
}

/// The queue prints the job id as a single token on stdout.
pub(crate) fn parse_job_id(stdout: &str) -> Result<String, QueueError> {
    let job_id = stdout.trim();
    if job_id.is_empty() || job_id.contains(char::is_whitespace) {
        return Err(QueueError::MissingJobId);
    }
    Ok(job_id.to_string())
}
