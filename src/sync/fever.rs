use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::storage::{Article, ArticlePage, ArticleQuery, Database, Feed, Folder, NewArticle};
use crate::sync::engine::RefreshSummary;
use crate::sync::error::SyncError;
use crate::sync::reconcile::{apply_assignments, reconcile};
use crate::sync::strategy::{AccountKind, ReaderStrategy, RefreshReason};
use crate::util::{clean_text, derive_id, first_img_src};

/// Marker key holding the highest remote item id already ingested.
const SINCE_ID_MARKER: &str = "fever.since_id";
/// Fever caps items responses at 50; this caps how many pages one refresh
/// will walk.
const MAX_ITEM_PAGES: usize = 40;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    groups: Vec<FeverGroup>,
    #[serde(default)]
    feeds_groups: Vec<FeverFeedsGroup>,
}

#[derive(Debug, Deserialize)]
struct FeverGroup {
    id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct FeverFeedsGroup {
    group_id: i64,
    /// Comma-separated feed ids, per the protocol.
    feed_ids: String,
}

#[derive(Debug, Deserialize)]
struct FeedsResponse {
    #[serde(default)]
    feeds: Vec<FeverFeed>,
    #[serde(default)]
    feeds_groups: Vec<FeverFeedsGroup>,
}

#[derive(Debug, Deserialize)]
struct FeverFeed {
    id: i64,
    title: String,
    url: String,
    #[serde(default)]
    site_url: Option<String>,
    #[serde(default)]
    last_updated_on_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<FeverItem>,
}

#[derive(Debug, Deserialize)]
struct FeverItem {
    id: i64,
    feed_id: i64,
    title: String,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    url: Option<String>,
    created_on_time: i64,
}

#[derive(Debug, Deserialize)]
struct IdsResponse {
    #[serde(default)]
    unread_item_ids: Option<String>,
    #[serde(default)]
    saved_item_ids: Option<String>,
}

/// Parses the protocol's comma-separated id lists; malformed entries are
/// skipped rather than failing the set.
fn parse_id_set(raw: Option<&str>) -> HashSet<i64> {
    raw.unwrap_or("")
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Local article id for a remote item.
fn item_local_id(remote_id: i64) -> String {
    derive_id(&remote_id.to_string())
}

// ============================================================================
// Client
// ============================================================================

/// Minimal Fever API client. The protocol is a single endpoint taking the
/// command in the query string and the credential as a POST form field.
pub struct FeverClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl FeverClient {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: SecretString) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    /// Issues one API call and deserializes the payload. `auth: 0` in the
    /// response is an authentication failure regardless of HTTP status.
    async fn call<T: serde::de::DeserializeOwned>(&self, command: &str) -> Result<T, SyncError> {
        let url = if command.is_empty() {
            format!("{}?api", self.endpoint)
        } else {
            format!("{}?api&{}", self.endpoint, command)
        };
        // The credential travels as a form field; the body is built by hand
        // (the key is constrained to MD5 hex, so no percent-encoding arises).
        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(format!("api_key={}", self.api_key.expose_secret()))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "Fever endpoint returned status {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::Parse(e.to_string()))?;
        if value.get("auth").and_then(|a| a.as_i64()) != Some(1) {
            return Err(SyncError::Auth);
        }
        serde_json::from_value(value).map_err(|e| SyncError::Parse(e.to_string()))
    }

    async fn groups(&self) -> Result<GroupsResponse, SyncError> {
        self.call("groups").await
    }

    async fn feeds(&self) -> Result<FeedsResponse, SyncError> {
        self.call("feeds").await
    }

    async fn items_since(&self, since_id: i64) -> Result<Vec<FeverItem>, SyncError> {
        let response: ItemsResponse = self.call(&format!("items&since_id={since_id}")).await?;
        Ok(response.items)
    }

    async fn unread_item_ids(&self) -> Result<HashSet<i64>, SyncError> {
        let response: IdsResponse = self.call("unread_item_ids").await?;
        Ok(parse_id_set(response.unread_item_ids.as_deref()))
    }

    async fn saved_item_ids(&self) -> Result<HashSet<i64>, SyncError> {
        let response: IdsResponse = self.call("saved_item_ids").await?;
        Ok(parse_id_set(response.saved_item_ids.as_deref()))
    }

    /// `mark=item&as=<flag>&id=<remote id>`. The response still carries
    /// `auth`, so a revoked key fails here too.
    async fn mark_item(&self, remote_id: i64, flag: &str) -> Result<(), SyncError> {
        let _: serde_json::Value = self
            .call(&format!("mark=item&as={flag}&id={remote_id}"))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Strategy for a Fever-compatible aggregator account. The remote owns all
/// state: refresh mirrors it into the local store, and status mutations go
/// remote-first so a failure never leaves the cache ahead of the server.
pub struct FeverStrategy {
    client: FeverClient,
    db: Database,
}

impl FeverStrategy {
    pub fn new(client: FeverClient, db: Database) -> Self {
        Self { client, db }
    }

    async fn remote_id_of(&self, article_id: &str) -> Result<i64, SyncError> {
        let article = self
            .db
            .get_article(article_id)
            .await?
            .ok_or_else(|| SyncError::Store(format!("unknown article: {article_id}")))?;
        article.remote_id.ok_or(SyncError::NotSupported)
    }

    async fn since_id(&self) -> Result<i64, SyncError> {
        let raw = self.db.get_marker(SINCE_ID_MARKER).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn fetch_all_items(&self, mut since_id: i64) -> Result<Vec<FeverItem>, SyncError> {
        let mut all = Vec::new();
        for _ in 0..MAX_ITEM_PAGES {
            let batch = self.client.items_since(since_id).await?;
            if batch.is_empty() {
                break;
            }
            since_id = batch.iter().map(|i| i.id).max().unwrap_or(since_id);
            all.extend(batch);
        }
        Ok(all)
    }
}

#[async_trait]
impl ReaderStrategy for FeverStrategy {
    fn kind(&self) -> AccountKind {
        AccountKind::Fever
    }

    async fn hydrate(&self, query: &ArticleQuery) -> Result<ArticlePage, SyncError> {
        Ok(self.db.list_page(query).await?)
    }

    async fn refresh(
        &self,
        _selected: Option<&str>,
        _reason: RefreshReason,
    ) -> Result<RefreshSummary, SyncError> {
        let since_id = self.since_id().await?;

        // Independent protocol calls go out in parallel; an Auth failure on
        // any of them aborts the whole pass before anything is written.
        let (groups, feeds, items, unread_remote, saved_remote) = tokio::try_join!(
            self.client.groups(),
            self.client.feeds(),
            self.fetch_all_items(since_id),
            self.client.unread_item_ids(),
            self.client.saved_item_ids(),
        )?;

        // Folders mirror remote groups, keeping the remote's ids.
        let now = chrono::Utc::now().timestamp();
        let folders: Vec<Folder> = groups
            .groups
            .iter()
            .map(|g| Folder {
                id: g.id,
                title: g.title.clone(),
                created_at: now,
            })
            .collect();
        self.db.upsert_folders(&folders).await?;

        // A feed may appear in several groups; the first mapping wins.
        let mut feed_to_group: HashMap<i64, i64> = HashMap::new();
        for mapping in groups.feeds_groups.iter().chain(feeds.feeds_groups.iter()) {
            for feed_id in parse_id_set(Some(&mapping.feed_ids)) {
                feed_to_group.entry(feed_id).or_insert(mapping.group_id);
            }
        }

        let mut remote_feed_ids: HashMap<i64, String> = HashMap::new();
        let mut feed_titles: HashMap<i64, String> = HashMap::new();
        let stored_feeds: Vec<Feed> = feeds
            .feeds
            .iter()
            .map(|f| {
                let local_id = derive_id(&f.url);
                remote_feed_ids.insert(f.id, local_id.clone());
                feed_titles.insert(f.id, f.title.clone());
                Feed {
                    id: local_id,
                    title: f.title.clone(),
                    url: f.url.clone(),
                    description: None,
                    image: None,
                    html_url: f.site_url.clone(),
                    last_updated: f
                        .last_updated_on_time
                        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
                        .map(|dt| dt.to_rfc3339()),
                    folder_id: feed_to_group.get(&f.id).copied(),
                    last_published_at: None,
                    last_published_ts: None,
                    expires_ts: None,
                    etag: None,
                    last_modified: None,
                }
            })
            .collect();
        self.db.upsert_feeds(&stored_feeds).await?;

        let max_item_id = items.iter().map(|i| i.id).max();
        let articles: Vec<NewArticle> = items
            .into_iter()
            .map(|item| {
                let published_at = chrono::DateTime::from_timestamp(item.created_on_time, 0)
                    .map(|dt| dt.to_rfc3339());
                NewArticle {
                    id: item_local_id(item.id),
                    feed_id: remote_feed_ids.get(&item.feed_id).cloned(),
                    remote_id: Some(item.id),
                    title: clean_text(Some(item.title)).unwrap_or_else(|| "Untitled".into()),
                    link: item.url,
                    source: feed_titles.get(&item.feed_id).cloned(),
                    published_at,
                    updated_at: None,
                    description: None,
                    thumbnail: item.html.as_deref().and_then(first_img_src),
                    content: item.html,
                }
            })
            .collect();
        let new_articles = self.db.upsert_articles(&articles).await?;

        // The remote's unread/saved sets are authoritative for every cached
        // article, applied in one transaction.
        let cached_ids = self.db.all_article_ids().await?;
        let unread: HashSet<String> = unread_remote.iter().map(|id| item_local_id(*id)).collect();
        let saved: HashSet<String> = saved_remote.iter().map(|id| item_local_id(*id)).collect();
        let assignments = reconcile(&cached_ids, &unread, &saved);
        apply_assignments(&self.db, &assignments).await?;

        if let Some(max_id) = max_item_id {
            self.db
                .set_marker(SINCE_ID_MARKER, &max_id.to_string())
                .await?;
        }

        tracing::info!(
            feeds = stored_feeds.len(),
            new_articles = new_articles,
            reconciled = assignments.len(),
            "Fever refresh complete"
        );
        Ok(RefreshSummary {
            feeds_used: stored_feeds.len(),
            new_articles,
        })
    }

    async fn get_article(&self, id: &str) -> Result<Option<Article>, SyncError> {
        Ok(self.db.get_article(id).await?)
    }

    async fn set_read(&self, article_id: &str, read: bool) -> Result<(), SyncError> {
        let remote_id = self.remote_id_of(article_id).await?;
        let flag = if read { "read" } else { "unread" };
        self.client.mark_item(remote_id, flag).await?;
        Ok(self.db.set_read(article_id, read).await?)
    }

    async fn set_saved(&self, article_id: &str, saved: bool) -> Result<(), SyncError> {
        let remote_id = self.remote_id_of(article_id).await?;
        let flag = if saved { "saved" } else { "unsaved" };
        self.client.mark_item(remote_id, flag).await?;
        Ok(self.db.set_saved(article_id, saved).await?)
    }

    async fn mark_all_read(&self, _feed_id: Option<&str>) -> Result<u64, SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, SyncError> {
        Ok(self.db.list_feeds().await?)
    }

    async fn add_feed(&self, _url: &str) -> Result<Feed, SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn remove_feed(&self, _feed_id: &str) -> Result<(), SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn list_folders(&self) -> Result<Vec<Folder>, SyncError> {
        Ok(self.db.list_folders().await?)
    }

    async fn create_folder(&self, _title: &str) -> Result<i64, SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn rename_folder(&self, _folder_id: i64, _title: &str) -> Result<(), SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn delete_folder(&self, _folder_id: i64) -> Result<(), SyncError> {
        Err(SyncError::NotSupported)
    }

    async fn set_feed_folder(
        &self,
        _feed_id: &str,
        _folder_id: Option<i64>,
    ) -> Result<(), SyncError> {
        Err(SyncError::NotSupported)
    }
}
