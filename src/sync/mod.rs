//! Synchronization: the refresh engine, account strategies (local and
//! Fever-compatible), single-flight refresh coordination, and bulk status
//! reconciliation.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fever;
pub mod local;
pub mod reconcile;
pub mod strategy;

pub use coordinator::RefreshCoordinator;
pub use engine::{import_subscriptions, RefreshSummary, SyncEngine};
pub use error::SyncError;
pub use fever::{FeverClient, FeverStrategy};
pub use local::LocalStrategy;
pub use strategy::{AccountKind, ReaderStrategy, RefreshReason, StrategyCache};
