//! Shell-command stages.
//!
//! The command runs under `sh -c` with `{"context": ..., "input": ...}` on
//! stdin. Its stdout must be the JSON payload for the stage; a non-zero exit
//! is a failure carrying stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Stage, StageContext};
use crate::config::StageCommand;
use crate::model::{StageInput, StageKind, StagePayload};

/// Longest stderr excerpt kept in an error message.
const STDERR_EXCERPT: usize = 2000;

#[derive(Serialize)]
struct Envelope<'a> {
    context: &'a StageContext,
    input: &'a StageInput,
}

#[derive(Debug, Clone)]
pub struct CommandStage {
    kind: StageKind,
    command: String,
    working_dir: PathBuf,
}

impl CommandStage {
    pub fn new(kind: StageKind, command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            kind,
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    /// Build from configuration, resolving `working_dir` against the project.
    pub fn from_config(kind: StageKind, config: &StageCommand, project_dir: &Path) -> Self {
        let working_dir = config
            .working_dir
            .as_ref()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    project_dir.join(p)
                }
            })
            .unwrap_or_else(|| project_dir.to_path_buf());
        Self::new(kind, config.command.clone(), working_dir)
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    fn parse_payload(&self, stdout: &[u8]) -> Result<StagePayload> {
        let text = String::from_utf8_lossy(stdout);
        let text = text.trim();
        if text.is_empty() {
            anyhow::bail!("{} command produced no output", self.kind);
        }
        let payload: StagePayload = serde_json::from_str(text)
            .with_context(|| format!("{} command printed invalid payload JSON", self.kind))?;
        Ok(match payload {
            StagePayload::Patch(patch) => StagePayload::Patch(patch.normalized()),
            other => other,
        })
    }
}

#[async_trait]
impl Stage for CommandStage {
    async fn run(&self, ctx: &StageContext, input: StageInput) -> Result<StagePayload> {
        let envelope = serde_json::to_string(&Envelope {
            context: ctx,
            input: &input,
        })
        .context("Failed to serialize stage input to JSON")?;

        debug!(
            run_id = %ctx.run_id,
            stage = %self.kind,
            attempt = ctx.attempt,
            command = %self.command,
            "spawning stage command"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("MENDER_RUN_ID", ctx.run_id.to_string())
            .env("MENDER_STAGE", self.kind.as_str())
            .env("MENDER_ATTEMPT", ctx.attempt.to_string())
            .env("MENDER_TARGET", ctx.target.key())
            .spawn()
            .with_context(|| format!("Failed to spawn stage command: {}", self.command))?;

        // A command may exit without reading its input.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(err) = stdin.write_all(envelope.as_bytes()).await
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(err).context("Failed to write input to stage stdin");
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for stage command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            anyhow::bail!(
                "{} command exited with {}: {}",
                self.kind,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                excerpt
            );
        }

        self.parse_payload(&output.stdout)
    }
}
