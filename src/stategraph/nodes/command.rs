//! External-process node
//!
//! The process receives the current state as a JSON object on stdin and must
//! print a JSON object (the partial update) on stdout. Empty output means "no
//! change". A non-zero exit status or a timeout fails the node.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::engine::error::NodeError;
use crate::engine::node::Node;
use crate::engine::state::{StateUpdate, WorkflowState};

#[derive(Debug, Clone)]
pub struct CommandNode {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandNode {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Node for CommandNode {
    async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        let input = serde_json::to_vec(state.values())?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A process that ignores its input may close stdin early
            if let Err(e) = stdin.write_all(&input).await {
                log::debug!("'{}' closed stdin early: {}", self.program, e);
            }
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| format!("'{}' timed out after {:?}", self.program, limit))??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )
            .into());
        }

        let stdout = String::from_utf8(output.stdout)?;
        if stdout.trim().is_empty() {
            return Ok(StateUpdate::new());
        }
        let value: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| format!("'{}' printed invalid JSON: {}", self.program, e))?;
        Ok(StateUpdate::try_from(value)?)
    }
}
