//! Channel selection with a single structured → subprocess fallback.
//!
//! ```text
//! Idle ──▶ TryPrimary ──ok──────────────▶ Done(Ok)
//!              │ transient      other err ▶ Done(Err primary)
//!              ▼
//!          TrySecondary ──ok─────────────▶ Done(Ok)
//!                       └─err────────────▶ Done(Err primary)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use relay_core::{BackendError, ExecuteRequest, ExecutionBackend, Response, UpdateSink};

enum Route {
    TryPrimary,
    TrySecondary { primary_error: BackendError },
    Done(Result<Response, BackendError>),
}

/// Routes a request to the structured channel, falling back to the
/// subprocess channel once on a transient failure.
pub struct BackendRouter {
    primary: Option<Arc<dyn ExecutionBackend>>,
    secondary: Arc<dyn ExecutionBackend>,
    /// Primary transient failures since the last primary success. Observed,
    /// never acted on.
    consecutive_failures: AtomicU32,
}

impl BackendRouter {
    /// `primary` is `None` when the structured channel is disabled.
    pub fn new(primary: Option<Arc<dyn ExecutionBackend>>, secondary: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            primary,
            secondary,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Response, BackendError> {
        let Some(primary) = &self.primary else {
            debug!(backend = %self.secondary.kind(), "structured channel disabled");
            return self.secondary.execute(request, sink).await;
        };

        let mut route = Route::TryPrimary;
        loop {
            route = match route {
                Route::TryPrimary => self.try_primary(primary, &request, &sink).await,
                Route::TrySecondary { primary_error } => {
                    self.try_secondary(&request, &sink, primary_error).await
                }
                Route::Done(result) => return result,
            };
        }
    }

    async fn try_primary(
        &self,
        primary: &Arc<dyn ExecutionBackend>,
        request: &ExecuteRequest,
        sink: &Arc<dyn UpdateSink>,
    ) -> Route {
        match primary.execute(request.clone(), sink.clone()).await {
            Ok(response) => {
                self.consecutive_failures.store(0, Ordering::Release);
                Route::Done(Ok(response))
            }
            Err(e) if e.is_transient() => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    backend = %primary.kind(),
                    error = %e,
                    error_kind = e.error_kind(),
                    failure_count = failures,
                    "structured channel failed, falling back to subprocess"
                );
                Route::TrySecondary { primary_error: e }
            }
            Err(e) => {
                error!(backend = %primary.kind(), error = %e, error_kind = e.error_kind(), "structured channel failed");
                Route::Done(Err(e))
            }
        }
    }

    async fn try_secondary(
        &self,
        request: &ExecuteRequest,
        sink: &Arc<dyn UpdateSink>,
        primary_error: BackendError,
    ) -> Route {
        match self.secondary.execute(request.clone(), sink.clone()).await {
            Ok(response) => {
                info!(backend = %self.secondary.kind(), "subprocess fallback succeeded");
                Route::Done(Ok(response))
            }
            // A critical tool denial is a policy outcome, not a channel fault.
            Err(e @ BackendError::StreamAborted(_)) => Route::Done(Err(e)),
            Err(e) => {
                error!(
                    primary_error = %primary_error,
                    secondary_error = %e,
                    "both channels failed"
                );
                Route::Done(Err(primary_error))
            }
        }
    }

    /// Kill in-flight runs on every channel.
    pub async fn kill_all(&self) -> usize {
        let mut killed = self.secondary.kill_all().await;
        if let Some(primary) = &self.primary {
            killed += primary.kill_all().await;
        }
        killed
    }
}
