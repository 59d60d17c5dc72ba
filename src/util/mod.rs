//! Shared helpers: deterministic id derivation and feed text processing.
//!
//! - **Ids**: URL-safe base64 of a stable upstream identifier, so repeated
//!   fetches of the same feed or item always map to the same row.
//! - **Text**: HTML entity decoding, `<img>`/og:image extraction, and lenient
//!   timestamp parsing for author-supplied date strings.
//! - **Urls**: scheme and address validation for untrusted subscription URLs.

mod ids;
mod text;
mod url_validator;

pub use ids::{dedupe_by_id, derive_id};
pub use text::{clean_text, decode_entities, first_img_src, og_image_from_html, parse_timestamp_ms};
pub use url_validator::{validate_url, UrlValidationError};
