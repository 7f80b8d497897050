use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use relay_core::{BackendError, BackendKind, ExecuteRequest, ExecutionBackend, Response, UpdateSink};

use crate::command::EngineCommand;
use crate::config::EngineConfig;
use crate::protocol::{self, TranscriptBuilder};
use crate::registry::ActiveRuns;

/// One-shot `-p` invocation. Lines that do not decode are logged and skipped.
pub struct SubprocessBackend {
    config: EngineConfig,
    runs: ActiveRuns,
}

impl SubprocessBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            runs: ActiveRuns::new(),
        }
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    async fn run(
        &self,
        request: ExecuteRequest,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Response, BackendError> {
        let started = Instant::now();
        let command = EngineCommand::new(&self.config, &request).with_prompt(&request.prompt);
        let mut child = command.spawn(&self.config)?;
        debug!(program = command.program(), "subprocess engine spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("engine stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Spawn("engine stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut transcript = TranscriptBuilder::new();
        let mut lines = BufReader::new(stdout).lines();
        let mut skipped = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let Some(message) = protocol::decode_lenient(&line) else {
                skipped += 1;
                debug!(line = %crate::tail(&line, 200), "skipping undecodable engine output");
                continue;
            };
            transcript.observe(&message);
            if let Some(update) = message.to_update() {
                sink.deliver(update).await.map_err(BackendError::StreamAborted)?;
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if skipped > 0 {
            debug!(skipped, "engine output contained undecodable lines");
        }

        if !status.success() {
            if let Some(err) = protocol::classify_engine_failure(&stderr_text) {
                return Err(err);
            }
            return Err(BackendError::ProcessFailed {
                code: status.code(),
                stderr: crate::tail(&stderr_text, 2000),
            });
        }

        let response = transcript.finish(started.elapsed());
        if response.is_error {
            if let Some(err) = protocol::classify_engine_failure(&response.content) {
                return Err(err);
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Response, BackendError> {
        let run = self.runs.register();
        let timeout = self.config.timeout;

        tokio::select! {
            result = self.run(request, sink) => result,
            _ = run.token().cancelled() => {
                warn!(backend = %BackendKind::Subprocess, "engine run killed");
                Err(BackendError::Killed)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(backend = %BackendKind::Subprocess, ?timeout, "engine run timed out");
                Err(BackendError::Timeout(timeout))
            }
        }
    }

    async fn kill_all(&self) -> usize {
        self.runs.cancel_all()
    }
}
