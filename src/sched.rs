//! Periodic background refresh with a persisted "new articles" marker.
//!
//! The scheduler never overlaps itself: an invocation that arrives while one
//! is still running reports `NoData` immediately. Outcomes cross the task
//! boundary as values, never panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::storage::Database;
use crate::sync::{ReaderStrategy, RefreshCoordinator, RefreshReason};

/// Marker key under which a completed background pass records its find.
pub const NEW_ARTICLES_MARKER: &str = "background.new_articles";

/// Platform schedulers throttle aggressive periodic work; below this interval
/// requests are clamped.
const MIN_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// What one scheduler invocation accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// New articles arrived and the marker was written.
    NewData,
    /// Nothing new (or the invocation was skipped/suppressed).
    NoData,
    /// The refresh or marker write failed; logged, never panicked.
    Failed,
}

/// Persisted record of a successful background pass, consumed by the next
/// foreground session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackgroundMarker {
    pub count: usize,
    pub timestamp: i64,
}

pub struct BackgroundScheduler {
    db: Database,
    coordinator: Arc<RefreshCoordinator>,
    strategy: Arc<dyn ReaderStrategy>,
    running: Mutex<()>,
    registered: AtomicBool,
}

impl BackgroundScheduler {
    pub fn new(
        db: Database,
        coordinator: Arc<RefreshCoordinator>,
        strategy: Arc<dyn ReaderStrategy>,
    ) -> Self {
        Self {
            db,
            coordinator,
            strategy,
            running: Mutex::new(()),
            registered: AtomicBool::new(false),
        }
    }

    /// One background pass. Non-reentrant: overlapping invocations return
    /// `NoData` without doing any work.
    pub async fn run_once(&self) -> TaskOutcome {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("Background pass already running, skipping");
            return TaskOutcome::NoData;
        };

        let strategy = Arc::clone(&self.strategy);
        let result = self
            .coordinator
            .refresh(RefreshReason::Background, move || {
                async move { strategy.refresh(None, RefreshReason::Background).await }.boxed()
            })
            .await;

        match result {
            Ok(Some(summary)) if summary.new_articles > 0 => {
                let marker = BackgroundMarker {
                    count: summary.new_articles,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                let payload = match serde_json::to_string(&marker) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode background marker");
                        return TaskOutcome::Failed;
                    }
                };
                if let Err(e) = self.db.set_marker(NEW_ARTICLES_MARKER, &payload).await {
                    tracing::warn!(error = %e, "Failed to persist background marker");
                    return TaskOutcome::Failed;
                }
                tracing::info!(count = marker.count, "Background pass found new articles");
                TaskOutcome::NewData
            }
            Ok(_) => {
                // No new data; a leftover marker from an earlier pass would
                // overstate what the next session finds.
                if let Err(e) = self.db.clear_marker(NEW_ARTICLES_MARKER).await {
                    tracing::warn!(error = %e, "Failed to clear background marker");
                    return TaskOutcome::Failed;
                }
                TaskOutcome::NoData
            }
            Err(e) => {
                tracing::warn!(error = %e, "Background refresh failed");
                TaskOutcome::Failed
            }
        }
    }

    /// Reads and clears the marker in one transaction, so a crash between
    /// read and clear cannot double-report.
    pub async fn consume_marker(&self) -> Result<Option<BackgroundMarker>> {
        let raw = self.db.take_marker(NEW_ARTICLES_MARKER).await?;
        match raw {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(marker) => Ok(Some(marker)),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable background marker");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Starts the periodic loop. Idempotent: the second and later calls are
    /// no-ops, as is a call with the feature disabled. Returns whether a loop
    /// was started.
    pub fn register(self: &Arc<Self>, enabled: bool, interval: Duration) -> bool {
        if !enabled {
            tracing::info!("Background refresh disabled by configuration");
            return false;
        }
        if self.registered.swap(true, Ordering::SeqCst) {
            return false;
        }

        let interval = effective_interval(interval);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the loop should wait a full
            // interval before its first pass.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let outcome = scheduler.run_once().await;
                tracing::debug!(outcome = ?outcome, "Scheduled background pass finished");
            }
        });
        tracing::info!(interval_secs = interval.as_secs(), "Background refresh registered");
        true
    }
}

/// Clamps a requested interval to the platform minimum.
fn effective_interval(requested: Duration) -> Duration {
    requested.max(MIN_INTERVAL)
}
