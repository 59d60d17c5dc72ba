//! quill: a feed synchronization and reconciliation engine.
//!
//! Feeds are fetched and parsed into a canonical model, persisted in SQLite,
//! and kept current by an incremental refresh engine. Accounts are served
//! through a [`sync::ReaderStrategy`]: either the local store is the source
//! of truth, or a Fever-compatible aggregator is mirrored into it.

pub mod config;
pub mod feed;
pub mod sched;
pub mod storage;
pub mod sync;
pub mod util;
