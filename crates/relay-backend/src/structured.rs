use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use relay_core::{BackendError, BackendKind, ExecuteRequest, ExecutionBackend, Response, UpdateSink};

use crate::command::EngineCommand;
use crate::config::EngineConfig;
use crate::protocol::{self, EngineMessage, TranscriptBuilder};
use crate::registry::ActiveRuns;

/// Bidirectional channel: the prompt goes in as a JSON message on stdin and
/// every stdout line must decode as a protocol message.
pub struct StructuredBackend {
    config: EngineConfig,
    runs: ActiveRuns,
}

impl StructuredBackend {
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
        let command = EngineCommand::new(&self.config, &request).with_streamed_input();
        let mut child = command.spawn(&self.config)?;
        debug!(program = command.program(), args = ?command.args(), "structured engine spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Spawn("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("engine stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Spawn("engine stderr unavailable".into()))?;

        let input = protocol::encode_user_message(&request.prompt)?;
        let (tx, mut rx) = mpsc::channel::<EngineMessage>(64);
        let mut io_tasks: JoinSet<Result<(), BackendError>> = JoinSet::new();

        io_tasks.spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            // Dropping stdin signals end of input.
            Ok(())
        });

        io_tasks.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(message) = protocol::decode_strict(&line)? {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
            Ok(())
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut transcript = TranscriptBuilder::new();
        while let Some(message) = rx.recv().await {
            transcript.observe(&message);
            if let Some(update) = message.to_update() {
                sink.deliver(update).await.map_err(BackendError::StreamAborted)?;
            }
        }

        let mut failures = Vec::new();
        while let Some(joined) = io_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(BackendError::Engine(format!("io task panicked: {e}"))),
            }
        }
        if !failures.is_empty() {
            let _ = child.start_kill();
            stderr_task.abort();
            return Err(match failures.len() {
                1 => failures.remove(0),
                _ => BackendError::TaskGroup(failures.iter().map(ToString::to_string).collect()),
            });
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() && !transcript.has_result() {
            if let Some(err) = protocol::classify_engine_failure(&stderr_text) {
                return Err(err);
            }
            return Err(BackendError::ProcessFailed {
                code: status.code(),
                stderr: crate::tail(&stderr_text, 2000),
            });
        }
        if !transcript.has_result() {
            return Err(BackendError::Decode("stream ended without a result message".into()));
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
impl ExecutionBackend for StructuredBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
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
                warn!(backend = %BackendKind::Structured, "engine run killed");
                Err(BackendError::Killed)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(backend = %BackendKind::Structured, ?timeout, "engine run timed out");
                Err(BackendError::Timeout(timeout))
            }
        }
    }

    async fn kill_all(&self) -> usize {
        self.runs.cancel_all()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scripted::RecordingSink;
    use relay_core::{UpdateKind, ValidationError};
    use std::path::Path;
    use std::time::Duration;

    fn backend(dir: &Path, script: &str, timeout: Duration) -> StructuredBackend {
        let path = dir.join("engine.sh");
        std::fs::write(&path, script).unwrap();
        StructuredBackend::new(EngineConfig {
            cli_path: "sh".into(),
            launcher_args: vec![path.display().to_string()],
            timeout,
            ..Default::default()
        })
    }

    fn request(dir: &Path) -> ExecuteRequest {
        ExecuteRequest {
            prompt: "hello".into(),
            working_directory: dir.to_path_buf(),
            session_id: None,
            continue_session: false,
            model: None,
        }
    }

    const HAPPY: &str = r#"read line
printf '%s\n' '{"type":"system","subtype":"init","session_id":"s-1"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"a.rs"}}]},"session_id":"s-1"}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"ok","session_id":"s-1","total_cost_usd":0.02,"num_turns":1}'
"#;

    #[tokio::test]
    async fn happy_path_streams_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), HAPPY, Duration::from_secs(10));
        let sink = Arc::new(RecordingSink::default());

        let response = backend.execute(request(dir.path()), sink.clone()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert_eq!(response.tools_used, vec!["Read"]);

        let kinds: Vec<UpdateKind> = sink.updates().iter().map(|u| u.kind).collect();
        assert_eq!(kinds, vec![UpdateKind::System, UpdateKind::Assistant, UpdateKind::Result]);
        assert_eq!(backend.active_runs(), 0);
    }

    #[tokio::test]
    async fn malformed_line_is_transient_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = "read line\necho 'this is not json'\nsleep 5\n";
        let backend = backend(dir.path(), script, Duration::from_secs(10));

        let err = backend
            .execute(request(dir.path()), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_result_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = "read line\nprintf '%s\\n' '{\"type\":\"system\",\"subtype\":\"init\"}'\n";
        let backend = backend(dir.path(), script, Duration::from_secs(10));

        let err = backend
            .execute(request(dir.path()), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn sink_refusal_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), HAPPY, Duration::from_secs(10));
        let sink = Arc::new(RecordingSink::refusing_after(1, ValidationError {
            tool_name: "Read".into(),
            message: "blocked".into(),
            blocked_tools: vec!["Read".into()],
            allowed_tools: vec![],
        }));

        let err = backend.execute(request(dir.path()), sink.clone()).await.unwrap_err();
        assert!(matches!(err, BackendError::StreamAborted(_)));
        assert_eq!(sink.updates().len(), 1);
    }

    #[tokio::test]
    async fn timeout_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "read line\nsleep 5\n", Duration::from_millis(200));

        let err = backend
            .execute(request(dir.path()), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn kill_all_terminates_in_flight_run() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend(dir.path(), "read line\nsleep 5\n", Duration::from_secs(30)));

        let running = {
            let backend = backend.clone();
            let req = request(dir.path());
            tokio::spawn(async move { backend.execute(req, Arc::new(RecordingSink::default())).await })
        };
        while backend.active_runs() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(backend.kill_all().await, 1);
        let result = running.await.unwrap();
        assert!(matches!(result, Err(BackendError::Killed)));
    }

    #[tokio::test]
    async fn non_zero_exit_without_result() {
        let dir = tempfile::tempdir().unwrap();
        let script = "read line\necho 'Invalid API key' >&2\nexit 1\n";
        let backend = backend(dir.path(), script, Duration::from_secs(10));

        let err = backend
            .execute(request(dir.path()), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::AuthenticationFailed(_)), "got {err:?}");
    }

    #[test]
    fn kind_is_structured() {
        let backend = StructuredBackend::new(EngineConfig::default());
        assert_eq!(backend.kind(), BackendKind::Structured);
    }
}
