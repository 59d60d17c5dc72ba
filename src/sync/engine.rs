use futures::stream::{self, StreamExt};

use crate::feed::{
    expiry_after_not_modified, fetch_feed, next_expiry_ms, opml, parse_feed, thumbnail,
    FetchOutcome,
};
use crate::storage::{Database, Feed, NewArticle};
use crate::sync::error::SyncError;
use crate::sync::strategy::RefreshReason;
use crate::util::{dedupe_by_id, derive_id};

/// Max feeds fetched concurrently in one pass.
const FETCH_CONCURRENCY: usize = 8;
/// Max og:image lookups per feed per pass. The lookup is best-effort; the
/// rest of the articles get their thumbnail on a later pass if ever.
const MAX_OG_LOOKUPS: usize = 4;

/// Bundled starter subscriptions, seeded on first refresh of an empty store.
const DEFAULT_OPML: &str = include_str!("../../assets/default_feeds.opml");

/// What one refresh pass accomplished.
#[derive(Debug, Clone, Default)]
pub struct RefreshSummary {
    /// Feeds that were actually fetched (skipped and failed feeds excluded).
    pub feeds_used: usize,
    /// Articles newly inserted across all fetched feeds.
    pub new_articles: usize,
}

/// Orchestrates one incremental refresh pass: resolve candidates, fetch
/// concurrently, filter to strictly-newer articles, persist feeds then
/// articles.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    client: reqwest::Client,
    seed_default_feeds: bool,
}

struct FeedOutcome {
    feed: Feed,
    articles: Vec<NewArticle>,
}

impl SyncEngine {
    pub fn new(db: Database, client: reqwest::Client, seed_default_feeds: bool) -> Self {
        Self {
            db,
            client,
            seed_default_feeds,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Refreshes one feed (by id) or all feeds.
    ///
    /// Feeds whose freshness window has not lapsed are skipped unless the
    /// refresh is manual. Individual feed failures are logged and excluded
    /// from the summary; only a pass where every attempted feed failed is
    /// surfaced as an error.
    pub async fn refresh(
        &self,
        selected: Option<&str>,
        reason: RefreshReason,
    ) -> Result<RefreshSummary, SyncError> {
        let candidates = self.resolve_candidates(selected).await?;
        if candidates.is_empty() {
            return Ok(RefreshSummary::default());
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let (due, skipped): (Vec<Feed>, Vec<Feed>) = candidates.into_iter().partition(|feed| {
            reason == RefreshReason::Manual || feed.expires_ts.unwrap_or(0) <= now_ms
        });
        if !skipped.is_empty() {
            tracing::debug!(skipped = skipped.len(), "Feeds within freshness window");
        }
        if due.is_empty() {
            return Ok(RefreshSummary::default());
        }

        let attempted = due.len();
        let results: Vec<Result<FeedOutcome, SyncError>> = stream::iter(due.into_iter())
            .map(|feed| {
                let client = self.client.clone();
                async move {
                    let url = feed.url.clone();
                    let result = Self::refresh_one(&client, feed, now_ms).await;
                    if let Err(e) = &result {
                        tracing::warn!(feed = %url, error = %e, "Feed refresh failed");
                    }
                    result
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut outcomes = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if outcomes.is_empty() {
            // Every attempted feed failed; the pass itself is a failure.
            return Err(first_error.unwrap_or(SyncError::Network("no feeds fetched".into())));
        }

        let feeds_used = outcomes.len();
        let feeds: Vec<Feed> = outcomes.iter().map(|o| o.feed.clone()).collect();
        let articles: Vec<NewArticle> = outcomes.into_iter().flat_map(|o| o.articles).collect();
        let articles = dedupe_by_id(articles, |a| &a.id);

        self.db.upsert_feeds(&feeds).await?;
        let new_articles = self.db.upsert_articles(&articles).await?;

        tracing::info!(
            feeds_used = feeds_used,
            attempted = attempted,
            new_articles = new_articles,
            "Refresh pass complete"
        );
        Ok(RefreshSummary {
            feeds_used,
            new_articles,
        })
    }

    async fn resolve_candidates(&self, selected: Option<&str>) -> Result<Vec<Feed>, SyncError> {
        if let Some(id) = selected {
            let feed = self
                .db
                .get_feed(id)
                .await?
                .ok_or_else(|| SyncError::Store(format!("unknown feed: {id}")))?;
            return Ok(vec![feed]);
        }

        let feeds = self.db.list_feeds().await?;
        if !feeds.is_empty() || !self.seed_default_feeds {
            return Ok(feeds);
        }

        tracing::info!("No subscriptions yet, seeding bundled defaults");
        let seeded = self.seed_defaults().await?;
        Ok(seeded)
    }

    async fn seed_defaults(&self) -> Result<Vec<Feed>, SyncError> {
        let subscriptions = opml::parse_opml_content(DEFAULT_OPML)
            .map_err(|e| SyncError::Parse(e.to_string()))?;
        let feeds = import_subscriptions(&self.db, &subscriptions).await?;
        Ok(feeds)
    }

    async fn refresh_one(
        client: &reqwest::Client,
        feed: Feed,
        now_ms: i64,
    ) -> Result<FeedOutcome, SyncError> {
        match fetch_feed(client, &feed).await? {
            FetchOutcome::NotModified { cache_control } => {
                let mut updated = feed;
                updated.expires_ts = Some(expiry_after_not_modified(
                    now_ms,
                    updated.expires_ts,
                    cache_control.as_deref(),
                    None,
                ));
                Ok(FeedOutcome {
                    feed: updated,
                    articles: Vec::new(),
                })
            }
            FetchOutcome::Fetched {
                bytes,
                cache_control,
                etag,
                last_modified,
            } => {
                let parsed = parse_feed(&bytes, &feed.url)?;
                let cutoff = feed.cutoff_ms();

                let mut fresh: Vec<NewArticle> = parsed
                    .articles
                    .into_iter()
                    .filter(|a| a.effective_ts() > cutoff)
                    .collect();

                let mut looked_up = 0;
                for article in fresh.iter_mut() {
                    if looked_up >= MAX_OG_LOOKUPS {
                        break;
                    }
                    if article.thumbnail.is_some() {
                        continue;
                    }
                    let Some(link) = article.link.clone() else {
                        continue;
                    };
                    article.thumbnail = thumbnail::resolve_og_image(client, &link).await;
                    looked_up += 1;
                }

                let mut updated = parsed.feed;
                if let Some(newest) = fresh.iter().max_by_key(|a| a.effective_ts()) {
                    updated.last_published_ts = Some(newest.effective_ts());
                    updated.last_published_at = newest
                        .updated_at
                        .clone()
                        .or_else(|| newest.published_at.clone());
                }
                updated.expires_ts = Some(next_expiry_ms(
                    now_ms,
                    cache_control.as_deref(),
                    parsed.hint,
                ));
                updated.etag = etag;
                updated.last_modified = last_modified;

                Ok(FeedOutcome {
                    feed: updated,
                    articles: fresh,
                })
            }
        }
    }
}

/// Stores OPML subscriptions: folders are created by title as needed, then
/// feeds are upserted with their folder assignment. Returns the stored feeds.
pub async fn import_subscriptions(
    db: &Database,
    subscriptions: &[opml::OpmlFeed],
) -> Result<Vec<Feed>, SyncError> {
    let mut folder_ids: std::collections::HashMap<String, i64> = db
        .list_folders()
        .await?
        .into_iter()
        .map(|f| (f.title.clone(), f.id))
        .collect();

    let mut feeds = Vec::with_capacity(subscriptions.len());
    for sub in subscriptions {
        let folder_id = match &sub.folder {
            Some(title) => match folder_ids.get(title) {
                Some(id) => Some(*id),
                None => {
                    let id = db.create_folder(title).await?;
                    folder_ids.insert(title.clone(), id);
                    Some(id)
                }
            },
            None => None,
        };
        feeds.push(Feed {
            id: derive_id(&sub.xml_url),
            title: sub.title.clone(),
            url: sub.xml_url.clone(),
            description: None,
            image: None,
            html_url: sub.html_url.clone(),
            last_updated: None,
            folder_id,
            last_published_at: None,
            last_published_ts: None,
            expires_ts: None,
            etag: None,
            last_modified: None,
        });
    }

    db.upsert_feeds(&feeds).await?;
    Ok(feeds)
}
