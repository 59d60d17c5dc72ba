use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::feed::opml::OpmlFeed;
use crate::storage::{Article, ArticlePage, ArticleQuery, Feed, Folder};
use crate::sync::engine::RefreshSummary;
use crate::sync::error::SyncError;

/// Why a refresh was requested. Manual refreshes bypass freshness windows and
/// the circuit breaker; background refreshes come from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Manual,
    Foreground,
    Background,
}

/// The kind of account a strategy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    /// Feeds fetched directly from their origins, all state local.
    Local,
    /// A Fever-compatible aggregator owns the state; we mirror it.
    Fever,
}

/// Everything the rest of the application needs from an account, regardless
/// of whether the source of truth is local or a remote aggregator.
///
/// Mutations on remote accounts go remote-first: the local cache is only
/// updated after the remote accepted the change. Operations a backend cannot
/// express return [`SyncError::NotSupported`].
#[async_trait]
pub trait ReaderStrategy: Send + Sync {
    fn kind(&self) -> AccountKind;

    /// Loads the current local view without touching the network.
    async fn hydrate(&self, query: &ArticleQuery) -> Result<ArticlePage, SyncError>;

    /// Pulls new data from the source of truth.
    async fn refresh(
        &self,
        selected: Option<&str>,
        reason: RefreshReason,
    ) -> Result<RefreshSummary, SyncError>;

    /// Imports subscriptions from parsed OPML outlines.
    async fn import_opml(&self, _subscriptions: &[OpmlFeed]) -> Result<usize, SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn get_article(&self, id: &str) -> Result<Option<Article>, SyncError>;
    async fn set_read(&self, article_id: &str, read: bool) -> Result<(), SyncError>;
    async fn set_saved(&self, article_id: &str, saved: bool) -> Result<(), SyncError>;
    async fn mark_all_read(&self, feed_id: Option<&str>) -> Result<u64, SyncError>;

    async fn list_feeds(&self) -> Result<Vec<Feed>, SyncError>;
    async fn add_feed(&self, url: &str) -> Result<Feed, SyncError>;
    async fn remove_feed(&self, feed_id: &str) -> Result<(), SyncError>;

    async fn list_folders(&self) -> Result<Vec<Folder>, SyncError>;
    async fn create_folder(&self, title: &str) -> Result<i64, SyncError>;
    async fn rename_folder(&self, folder_id: i64, title: &str) -> Result<(), SyncError>;
    async fn delete_folder(&self, folder_id: i64) -> Result<(), SyncError>;
    async fn set_feed_folder(
        &self,
        feed_id: &str,
        folder_id: Option<i64>,
    ) -> Result<(), SyncError>;
}

// ============================================================================
// Strategy Cache
// ============================================================================

/// Caches one built strategy per account id, rebuilding when the account's
/// kind changes (e.g. a local account reconfigured as Fever).
pub struct StrategyCache {
    inner: Mutex<Option<CachedStrategy>>,
}

struct CachedStrategy {
    account_id: String,
    kind: AccountKind,
    strategy: Arc<dyn ReaderStrategy>,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Returns the cached strategy for `account_id`, or builds one via
    /// `build` when the cache is empty, for a different account, or the
    /// account's kind changed.
    pub async fn get_or_build<F>(
        &self,
        account_id: &str,
        kind: AccountKind,
        build: F,
    ) -> Arc<dyn ReaderStrategy>
    where
        F: FnOnce() -> Arc<dyn ReaderStrategy>,
    {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.account_id == account_id && cached.kind == kind {
                return Arc::clone(&cached.strategy);
            }
            tracing::debug!(
                account = %account_id,
                "Rebuilding reader strategy (account or kind changed)"
            );
        }
        let strategy = build();
        *guard = Some(CachedStrategy {
            account_id: account_id.to_string(),
            kind,
            strategy: Arc::clone(&strategy),
        });
        strategy
    }
}

impl Default for StrategyCache {
    fn default() -> Self {
        Self::new()
    }
}
