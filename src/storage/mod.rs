//! Relational persistence for feeds, articles, folders, and sync state.
//!
//! One `Database` handle (a cloneable sqlx pool) with operations split by
//! concern: feed CRUD, status-preserving article upserts, folder management,
//! and FTS5 search with a LIKE fallback. Article status (read/saved) lives in
//! a separate table from content so re-ingestion can never clobber it.

mod articles;
mod feeds;
mod folders;
mod schema;
mod search;
mod types;

pub use schema::Database;
pub use search::SearchQuery;
pub use types::{Article, ArticlePage, ArticleQuery, Feed, Folder, NewArticle, StoreError};
