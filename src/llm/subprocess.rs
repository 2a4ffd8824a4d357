//! Adapter that runs an external command per call.
//!
//! The prompt is written to the child's stdin and its stdout is the output.
//! The model id and provider are exported as `EVALFORGE_MODEL` and
//! `EVALFORGE_PROVIDER`. A child that outlives its timeout, or whose call is
//! cancelled, is killed when the handle drops.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SubprocessPolicy;
use crate::error::ProviderError;
use crate::llm::adapter::{InvokeOutput, InvokeRequest, ProviderAdapter};

pub struct SubprocessAdapter {
    command: String,
    args: Vec<String>,
}

impl SubprocessAdapter {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_policy(policy: &SubprocessPolicy) -> Self {
        Self::new(policy.command.clone(), policy.args.clone())
    }

    async fn run(&self, request: &InvokeRequest) -> Result<InvokeOutput, ProviderError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("EVALFORGE_MODEL", request.model_name())
            .env("EVALFORGE_PROVIDER", request.provider())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::permanent(format!("Failed to spawn '{}': {}", self.command, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = String::new();
            if let Some(system) = &request.system {
                input.push_str(system);
                input.push_str("\n\n");
            }
            input.push_str(&request.user);
            // A child that ignores stdin may close it early; that is not an error.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                tracing::debug!(command = %self.command, error = %e, "Subprocess closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::transient(format!("Failed to wait for '{}': {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::permanent(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(ProviderError::transient(format!(
                "'{}' produced no output",
                self.command
            )));
        }
        Ok(InvokeOutput::text(stdout))
    }
}

#[async_trait]
impl ProviderAdapter for SubprocessAdapter {
    async fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<InvokeOutput, ProviderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::cancelled("call cancelled")),
            result = tokio::time::timeout(request.timeout, self.run(request)) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::warn!(
                        command = %self.command,
                        timeout = ?request.timeout,
                        "Subprocess exceeded wall-clock timeout, killed"
                    );
                    Err(ProviderError::timeout(format!(
                        "'{}' exceeded {:?}",
                        self.command, request.timeout
                    )))
                }
            },
        }
    }
}
