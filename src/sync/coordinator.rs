use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::sync::engine::RefreshSummary;
use crate::sync::error::SyncError;
use crate::sync::strategy::RefreshReason;

/// Non-manual refreshes are suppressed while the last completed pass is
/// younger than this.
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<RefreshSummary>, Arc<SyncError>>>>;

/// Serializes refresh passes for one account.
///
/// Concurrent callers join the same pending pass instead of launching their
/// own. A failed pass trips a circuit breaker: non-manual refreshes return
/// `Ok(None)` without network work until a manual refresh succeeds.
pub struct RefreshCoordinator {
    state: Mutex<CoordinatorState>,
    stale_after: Duration,
}

struct CoordinatorState {
    in_flight: Option<(RefreshReason, SharedRefresh)>,
    last_completed: Option<Instant>,
    broken: bool,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::with_staleness(STALE_AFTER)
    }

    pub fn with_staleness(stale_after: Duration) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                in_flight: None,
                last_completed: None,
                broken: false,
            }),
            stale_after,
        }
    }

    /// Runs (or joins) a refresh. `Ok(None)` means the refresh was suppressed
    /// by the staleness window or the circuit breaker; `Ok(Some(_))` carries
    /// the summary of the pass this call observed.
    pub async fn refresh<F>(
        &self,
        reason: RefreshReason,
        make: F,
    ) -> Result<Option<Arc<RefreshSummary>>, Arc<SyncError>>
    where
        F: FnOnce() -> BoxFuture<'static, Result<RefreshSummary, SyncError>>,
    {
        let shared = {
            let mut state = self.state.lock().await;
            match &state.in_flight {
                Some((_, pending)) => pending.clone(),
                None => {
                    if reason != RefreshReason::Manual {
                        if state.broken {
                            tracing::debug!("Refresh suppressed: circuit breaker open");
                            return Ok(None);
                        }
                        if let Some(completed) = state.last_completed {
                            if completed.elapsed() < self.stale_after {
                                tracing::debug!("Refresh suppressed: data still fresh");
                                return Ok(None);
                            }
                        }
                    }
                    let pending: SharedRefresh = make()
                        .map(|r| r.map(Arc::new).map_err(Arc::new))
                        .boxed()
                        .shared();
                    state.in_flight = Some((reason, pending.clone()));
                    pending
                }
            }
        };

        let result = shared.await;
        self.finalize().await;
        result.map(Some)
    }

    /// First waiter to get here after completion clears the in-flight slot
    /// and folds the outcome into the breaker state.
    async fn finalize(&self) {
        let mut state = self.state.lock().await;
        let completed = matches!(&state.in_flight, Some((_, fut)) if fut.peek().is_some());
        if !completed {
            return;
        }
        if let Some((run_reason, fut)) = state.in_flight.take() {
            match fut.peek() {
                Some(Ok(_)) => {
                    state.last_completed = Some(Instant::now());
                    if run_reason == RefreshReason::Manual {
                        state.broken = false;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Refresh failed, opening circuit breaker");
                    state.broken = true;
                }
                None => {}
            }
        }
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use pretty_assertions::assert_eq;

    fn counting_pass(
        counter: Arc<AtomicUsize>,
        delay: Duration,
    ) -> BoxFuture<'static, Result<RefreshSummary, SyncError>> {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(RefreshSummary {
                feeds_used: 1,
                new_articles: 2,
            })
        }
        .boxed()
    }

    fn failing_pass() -> BoxFuture<'static, Result<RefreshSummary, SyncError>> {
        async { Err(SyncError::Network("boom".into())) }.boxed()
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_pass() {
        let coordinator = Arc::new(RefreshCoordinator::with_staleness(Duration::ZERO));
        let runs = Arc::new(AtomicUsize::new(0));

        let a = {
            let coordinator = Arc::clone(&coordinator);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                coordinator
                    .refresh(RefreshReason::Manual, move || {
                        counting_pass(runs, Duration::from_millis(100))
                    })
                    .await
            })
        };
        // Let the first call claim the slot before the second arrives
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = {
            let coordinator = Arc::clone(&coordinator);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                coordinator
                    .refresh(RefreshReason::Manual, move || {
                        counting_pass(runs, Duration::from_millis(100))
                    })
                    .await
            })
        };

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1, "one underlying pass");
        assert_eq!(ra.unwrap().new_articles, 2);
        assert_eq!(rb.unwrap().new_articles, 2);
    }

    #[tokio::test]
    async fn staleness_window_suppresses_non_manual() {
        let coordinator = RefreshCoordinator::with_staleness(Duration::from_secs(300));
        let runs = Arc::new(AtomicUsize::new(0));

        let first = coordinator
            .refresh(RefreshReason::Foreground, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(first.is_some());

        let second = coordinator
            .refresh(RefreshReason::Foreground, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(second.is_none(), "fresh data suppresses the pass");

        // Manual ignores the window
        let manual = coordinator
            .refresh(RefreshReason::Manual, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(manual.is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_blocks_non_manual_until_manual_success() {
        let coordinator = RefreshCoordinator::with_staleness(Duration::ZERO);
        let runs = Arc::new(AtomicUsize::new(0));

        let failed = coordinator
            .refresh(RefreshReason::Background, failing_pass)
            .await;
        assert!(failed.is_err());

        // Breaker open: background returns None without running anything
        let suppressed = coordinator
            .refresh(RefreshReason::Background, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(suppressed.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Manual proceeds and its success closes the breaker
        let manual = coordinator
            .refresh(RefreshReason::Manual, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(manual.is_some());

        let background = coordinator
            .refresh(RefreshReason::Background, {
                let runs = Arc::clone(&runs);
                move || counting_pass(runs, Duration::ZERO)
            })
            .await
            .unwrap();
        assert!(background.is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
