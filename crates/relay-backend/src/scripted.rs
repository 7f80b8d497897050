use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::{
    BackendError, BackendKind, ExecuteRequest, ExecutionBackend, Response, StreamUpdate, ToolCall,
    UpdateSink, ValidationError,
};

use crate::registry::ActiveRuns;

/// Pre-programmed outcome of one `execute` call.
#[derive(Clone, Debug)]
pub enum ScriptedRun {
    /// Deliver the updates in order, then return the response.
    Stream {
        updates: Vec<StreamUpdate>,
        response: Response,
    },
    /// Fail the call without delivering anything.
    Error(BackendError),
    /// Wait, then resolve the inner run. Cancellable through `kill_all`.
    Delay(Duration, Box<ScriptedRun>),
}

impl ScriptedRun {
    /// A plain text answer carrying an engine session id.
    pub fn reply(text: &str, session_id: &str) -> Self {
        Self::Stream {
            updates: vec![StreamUpdate::assistant(text).with_session_id(session_id)],
            response: Response::text(text).with_session_id(session_id),
        }
    }

    /// An answer preceded by one tool-use update per call.
    pub fn with_tool_calls(text: &str, session_id: &str, calls: Vec<ToolCall>) -> Self {
        let tools: Vec<String> = calls.iter().map(|c| c.name.clone()).collect();
        Self::Stream {
            updates: vec![
                StreamUpdate::tool_use(calls).with_session_id(session_id),
                StreamUpdate::assistant(text).with_session_id(session_id),
            ],
            response: Response::text(text)
                .with_session_id(session_id)
                .with_tools(tools),
        }
    }

    pub fn delayed(delay: Duration, inner: ScriptedRun) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Replays [`ScriptedRun`]s in sequence and records every request it saw.
pub struct ScriptedBackend {
    kind: BackendKind,
    runs: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<ExecuteRequest>>,
    call_count: AtomicUsize,
    active: ActiveRuns,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, runs: Vec<ScriptedRun>) -> Self {
        Self {
            kind,
            runs: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            active: ActiveRuns::new(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.lock().clone()
    }

    pub fn active_runs(&self) -> usize {
        self.active.len()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Response, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request);
        let next = self.runs.lock().pop_front();
        let mut current = next.ok_or_else(|| {
            BackendError::Engine(format!("{} backend: no scripted run for call {idx}", self.kind))
        })?;

        let run = self.active.register();
        loop {
            match current {
                ScriptedRun::Stream { updates, response } => {
                    for update in updates {
                        sink.deliver(update).await.map_err(BackendError::StreamAborted)?;
                    }
                    return Ok(response);
                }
                ScriptedRun::Error(e) => return Err(e),
                ScriptedRun::Delay(duration, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => current = *inner,
                        _ = run.token().cancelled() => return Err(BackendError::Killed),
                    }
                }
            }
        }
    }

    async fn kill_all(&self) -> usize {
        self.active.cancel_all()
    }
}

/// Sink that stores every update, optionally refusing after a number of them.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StreamUpdate>>,
    refuse: Option<(usize, ValidationError)>,
}

impl RecordingSink {
    pub fn refusing_after(accepted: usize, error: ValidationError) -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            refuse: Some((accepted, error)),
        }
    }

    pub fn updates(&self) -> Vec<StreamUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn deliver(&self, update: StreamUpdate) -> Result<(), ValidationError> {
        let mut updates = self.updates.lock();
        if let Some((accepted, error)) = &self.refuse {
            if updates.len() >= *accepted {
                return Err(error.clone());
            }
        }
        updates.push(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            prompt: "hi".into(),
            working_directory: "/work".into(),
            session_id: None,
            continue_session: false,
            model: None,
        }
    }

    #[tokio::test]
    async fn replays_in_order_and_records_requests() {
        let backend = ScriptedBackend::new(
            BackendKind::Structured,
            vec![ScriptedRun::reply("one", "s-1"), ScriptedRun::reply("two", "s-1")],
        );
        let sink = Arc::new(RecordingSink::default());

        let first = backend.execute(request(), sink.clone()).await.unwrap();
        let second = backend.execute(request(), sink.clone()).await.unwrap();
        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.requests().len(), 2);
        assert_eq!(sink.updates().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let backend = ScriptedBackend::new(BackendKind::Subprocess, vec![]);
        let err = backend
            .execute(request(), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Engine(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn scripted_error_returned() {
        let backend = ScriptedBackend::new(
            BackendKind::Structured,
            vec![ScriptedRun::Error(BackendError::Decode("bad".into()))],
        );
        let err = backend
            .execute(request(), Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn refused_update_aborts() {
        let backend = ScriptedBackend::new(
            BackendKind::Structured,
            vec![ScriptedRun::with_tool_calls(
                "done",
                "s-1",
                vec![ToolCall::new("Write", json!({"file_path": "/etc/passwd"}))],
            )],
        );
        let refusal = ValidationError {
            tool_name: "Write".into(),
            message: "blocked".into(),
            blocked_tools: vec!["Write".into()],
            allowed_tools: vec![],
        };
        let sink = Arc::new(RecordingSink::refusing_after(0, refusal.clone()));

        let err = backend.execute(request(), sink.clone()).await.unwrap_err();
        match err {
            BackendError::StreamAborted(v) => assert_eq!(v, refusal),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(sink.updates().is_empty());
        assert_eq!(backend.active_runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_cancellable() {
        let backend = Arc::new(ScriptedBackend::new(
            BackendKind::Structured,
            vec![ScriptedRun::delayed(Duration::from_secs(60), ScriptedRun::reply("late", "s-1"))],
        ));
        let running = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.execute(request(), Arc::new(RecordingSink::default())).await })
        };
        while backend.active_runs() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(backend.kill_all().await, 1);
        assert!(matches!(running.await.unwrap(), Err(BackendError::Killed)));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_then_reply() {
        let backend = ScriptedBackend::new(
            BackendKind::Subprocess,
            vec![ScriptedRun::delayed(Duration::from_secs(5), ScriptedRun::reply("late", "s-2"))],
        );
        let response = backend
            .execute(request(), Arc::new(RecordingSink::default()))
            .await
            .unwrap();
        assert_eq!(response.session_id.as_deref(), Some("s-2"));
    }
}
