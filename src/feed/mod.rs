//! Feed acquisition: HTTP fetching with conditional requests, RSS/Atom
//! parsing into the canonical model, freshness policy, thumbnail resolution,
//! and OPML import/export.

pub mod fetcher;
pub mod freshness;
pub mod opml;
pub mod parser;
pub mod thumbnail;

pub use fetcher::{fetch_feed, FetchError, FetchOutcome};
pub use freshness::{
    expiry_after_not_modified, next_expiry_ms, parse_cache_control, UpdateHint, UpdatePeriod,
    DEFAULT_FRESHNESS_SECS,
};
pub use parser::{parse_feed, ParseError, ParsedFeed};
