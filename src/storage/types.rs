use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-layer errors with user-facing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process has the database locked.
    #[error("Another instance of quill appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed.
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error.
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Classify a sqlx error, detecting SQLite lock conditions.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
///
/// `id` is derived deterministically from the canonical URL
/// (`util::derive_id`), so the same URL always maps to the same row.
/// The freshness fields (`last_published_*`, `expires_ts`, `etag`,
/// `last_modified`) are maintained by the sync engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub html_url: Option<String>,
    /// Server-declared update timestamp, free-form.
    pub last_updated: Option<String>,
    pub folder_id: Option<i64>,
    /// High-water mark for incremental fetch, as the upstream string.
    pub last_published_at: Option<String>,
    /// High-water mark in epoch ms; preferred over the string form.
    pub last_published_ts: Option<i64>,
    /// Instant (epoch ms) after which a re-fetch is permitted.
    pub expires_ts: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Feed {
    /// The cutoff timestamp used by the incremental-fetch filter: the numeric
    /// high-water mark when present, else the parsed string form, else 0.
    pub fn cutoff_ms(&self) -> i64 {
        if let Some(ts) = self.last_published_ts {
            return ts;
        }
        self.last_published_at
            .as_deref()
            .and_then(crate::util::parse_timestamp_ms)
            .unwrap_or(0)
    }
}

/// Article content as produced by the parser or the remote client, before any
/// status is attached. Upserting a `NewArticle` never touches read/saved.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub id: String,
    /// Absent for standalone saved-for-later articles.
    pub feed_id: Option<String>,
    /// Opaque remote item id (Fever); needed for remote status writes.
    pub remote_id: Option<i64>,
    pub title: String,
    pub link: Option<String>,
    /// Display name of the origin, usually the feed title.
    pub source: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub thumbnail: Option<String>,
}

impl NewArticle {
    /// Effective timestamp for ordering and the incremental filter:
    /// `updated_at` else `published_at` else 0.
    pub fn effective_ts(&self) -> i64 {
        self.updated_at
            .as_deref()
            .and_then(crate::util::parse_timestamp_ms)
            .or_else(|| {
                self.published_at
                    .as_deref()
                    .and_then(crate::util::parse_timestamp_ms)
            })
            .unwrap_or(0)
    }
}

/// A stored article with its status flags joined in.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: String,
    pub feed_id: Option<String>,
    pub remote_id: Option<i64>,
    pub title: String,
    pub link: Option<String>,
    pub source: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub thumbnail: Option<String>,
    pub sort_ts: i64,
    pub read: bool,
    pub saved: bool,
}

/// Row type for article queries; status columns are nullable because the
/// status row is LEFT JOINed.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: String,
    pub feed_id: Option<String>,
    pub remote_id: Option<i64>,
    pub title: String,
    pub link: Option<String>,
    pub source: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub thumbnail: Option<String>,
    pub sort_ts: i64,
    pub read: Option<bool>,
    pub saved: Option<bool>,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            remote_id: self.remote_id,
            title: self.title,
            link: self.link,
            source: self.source,
            published_at: self.published_at,
            updated_at: self.updated_at,
            description: self.description,
            content: self.content,
            thumbnail: self.thumbnail,
            sort_ts: self.sort_ts,
            read: self.read.unwrap_or(false),
            saved: self.saved.unwrap_or(false),
        }
    }
}

/// A feed folder. Feeds belong to at most one folder; no nesting.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub title: String,
    /// Epoch seconds.
    pub created_at: i64,
}

// ============================================================================
// Query Types
// ============================================================================

/// Filtered, paged article listing request.
#[derive(Debug, Clone, Default)]
pub struct ArticleQuery {
    pub feed_id: Option<String>,
    pub unread_only: bool,
    pub saved_only: bool,
    /// Zero-based page index.
    pub page: u32,
    pub page_size: u32,
}

/// One page of articles plus the unpaged total.
#[derive(Debug)]
pub struct ArticlePage {
    pub articles: Vec<Article>,
    pub total: i64,
}
