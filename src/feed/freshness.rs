//! Feed freshness policy: when is a re-fetch of a feed actually warranted?
//!
//! Derives an expiry instant (epoch ms) from HTTP cache headers and the
//! optional `sy:updatePeriod`/`sy:updateFrequency` syndication hints some
//! feeds declare. The sync engine skips feeds whose window has not elapsed,
//! and a 304 response pushes an already-lapsed window forward so a quiet
//! server is not hammered on every pass.

/// Fallback window when no usable cache directive exists.
pub const DEFAULT_FRESHNESS_SECS: i64 = 5 * 60;

/// Parses a cache-control-like header value into a freshness interval.
///
/// Directives are split on commas or semicolons. `max-age` wins over
/// `s-maxage` when both are present. Returns `None` when no directive is
/// found or the value is not a plain non-negative integer.
pub fn parse_cache_control(header: &str) -> Option<i64> {
    let mut max_age = None;
    let mut s_maxage = None;

    for directive in header.split([',', ';']) {
        let directive = directive.trim();
        let lower = directive.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("max-age=") {
            max_age = parse_plain_seconds(value);
        } else if let Some(value) = lower.strip_prefix("s-maxage=") {
            s_maxage = parse_plain_seconds(value);
        }
    }

    max_age.or(s_maxage)
}

/// Accepts only unsigned decimal digits; rejects signs, quotes, and decimals.
fn parse_plain_seconds(value: &str) -> Option<i64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Syndication module update period (`sy:updatePeriod`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl UpdatePeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    fn secs(self) -> i64 {
        match self {
            Self::Hourly => 60 * 60,
            Self::Daily => 24 * 60 * 60,
            Self::Weekly => 7 * 24 * 60 * 60,
            Self::Monthly => 30 * 24 * 60 * 60,
            Self::Yearly => 365 * 24 * 60 * 60,
        }
    }
}

/// A feed's declared update cadence: one period divided by a frequency.
#[derive(Debug, Clone, Copy)]
pub struct UpdateHint {
    pub period: UpdatePeriod,
    /// Updates per period; a missing or zero frequency counts as 1.
    pub frequency: u32,
}

impl UpdateHint {
    pub fn interval_secs(&self) -> i64 {
        self.period.secs() / i64::from(self.frequency.max(1))
    }
}

/// Computes the next instant (epoch ms) before which the feed should not be
/// re-fetched.
///
/// The header-derived interval (default 5 minutes when absent) is used unless
/// the feed's own syndication hint yields a longer one; the feed knows its
/// cadence better than a generic cache header does.
pub fn next_expiry_ms(
    now_ms: i64,
    cache_control: Option<&str>,
    hint: Option<UpdateHint>,
) -> i64 {
    let header_secs = cache_control
        .and_then(parse_cache_control)
        .unwrap_or(DEFAULT_FRESHNESS_SECS);

    let secs = match hint {
        Some(h) if h.interval_secs() > header_secs => h.interval_secs(),
        _ => header_secs,
    };

    now_ms + secs * 1000
}

/// Expiry to store after a "not modified" response.
///
/// If the stored window is still in the future it stands; if it has lapsed,
/// it is bumped forward by the normal policy so the next pass does not
/// immediately re-fetch a feed the server just said was unchanged.
pub fn expiry_after_not_modified(
    now_ms: i64,
    stored_expiry_ms: Option<i64>,
    cache_control: Option<&str>,
    hint: Option<UpdateHint>,
) -> i64 {
    match stored_expiry_ms {
        Some(expiry) if expiry > now_ms => expiry,
        _ => next_expiry_ms(now_ms, cache_control, hint),
    }
}
