use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

struct ActiveRun {
    cancel: CancellationToken,
    _started_at: Instant,
}

/// In-flight engine runs of one backend, so they can be killed together.
#[derive(Default)]
pub struct ActiveRuns {
    runs: DashMap<u64, ActiveRun>,
    next_id: AtomicU64,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new run until the returned guard is dropped.
    pub fn register(&self) -> RunGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.runs.insert(
            id,
            ActiveRun {
                cancel: cancel.clone(),
                _started_at: Instant::now(),
            },
        );
        RunGuard {
            runs: self,
            id,
            cancel,
        }
    }

    /// Signal every tracked run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        self.runs.retain(|_, run| {
            run.cancel.cancel();
            count += 1;
            false
        });
        count
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

pub struct RunGuard<'a> {
    runs: &'a ActiveRuns,
    id: u64,
    cancel: CancellationToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runs.runs.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_unregisters_on_drop() {
        let runs = ActiveRuns::new();
        {
            let _a = runs.register();
            let _b = runs.register();
            assert_eq!(runs.len(), 2);
        }
        assert!(runs.is_empty());
    }

    #[test]
    fn cancel_all_signals_and_counts() {
        let runs = ActiveRuns::new();
        let a = runs.register();
        let b = runs.register();
        assert_eq!(runs.cancel_all(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(runs.is_empty());
    }

    #[test]
    fn run_registered_after_cancel_all_stays_reachable() {
        let runs = ActiveRuns::new();
        let a = runs.register();
        assert_eq!(runs.cancel_all(), 1);
        assert!(a.token().is_cancelled());

        let b = runs.register();
        assert!(!b.token().is_cancelled());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs.cancel_all(), 1);
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn cancel_all_when_idle() {
        assert_eq!(ActiveRuns::new().cancel_all(), 0);
    }
}
