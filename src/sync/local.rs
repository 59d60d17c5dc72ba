use async_trait::async_trait;

use crate::feed::opml::OpmlFeed;
use crate::storage::{Article, ArticlePage, ArticleQuery, Database, Feed, Folder};
use crate::sync::engine::{import_subscriptions, RefreshSummary, SyncEngine};
use crate::sync::error::SyncError;
use crate::sync::strategy::{AccountKind, ReaderStrategy, RefreshReason};
use crate::util::derive_id;

/// Strategy for a local account: the store is the source of truth and every
/// operation resolves directly against it.
pub struct LocalStrategy {
    engine: SyncEngine,
}

impl LocalStrategy {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }

    fn db(&self) -> &Database {
        self.engine.db()
    }
}

#[async_trait]
impl ReaderStrategy for LocalStrategy {
    fn kind(&self) -> AccountKind {
        AccountKind::Local
    }

    async fn hydrate(&self, query: &ArticleQuery) -> Result<ArticlePage, SyncError> {
        Ok(self.db().list_page(query).await?)
    }

    async fn refresh(
        &self,
        selected: Option<&str>,
        reason: RefreshReason,
    ) -> Result<RefreshSummary, SyncError> {
        self.engine.refresh(selected, reason).await
    }

    async fn import_opml(&self, subscriptions: &[OpmlFeed]) -> Result<usize, SyncError> {
        let feeds = import_subscriptions(self.db(), subscriptions).await?;
        Ok(feeds.len())
    }

    async fn get_article(&self, id: &str) -> Result<Option<Article>, SyncError> {
        Ok(self.db().get_article(id).await?)
    }

    async fn set_read(&self, article_id: &str, read: bool) -> Result<(), SyncError> {
        Ok(self.db().set_read(article_id, read).await?)
    }

    async fn set_saved(&self, article_id: &str, saved: bool) -> Result<(), SyncError> {
        Ok(self.db().set_saved(article_id, saved).await?)
    }

    async fn mark_all_read(&self, feed_id: Option<&str>) -> Result<u64, SyncError> {
        Ok(self.db().set_all_read(feed_id).await?)
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, SyncError> {
        Ok(self.db().list_feeds().await?)
    }

    async fn add_feed(&self, url: &str) -> Result<Feed, SyncError> {
        let feed = Feed {
            id: derive_id(url),
            title: url.to_string(),
            url: url.to_string(),
            description: None,
            image: None,
            html_url: None,
            last_updated: None,
            folder_id: None,
            last_published_at: None,
            last_published_ts: None,
            expires_ts: None,
            etag: None,
            last_modified: None,
        };
        self.db().upsert_feeds(std::slice::from_ref(&feed)).await?;
        // First refresh fills in the real title and metadata
        let _ = self
            .engine
            .refresh(Some(&feed.id), RefreshReason::Manual)
            .await;
        Ok(self
            .db()
            .get_feed(&feed.id)
            .await?
            .unwrap_or(feed))
    }

    async fn remove_feed(&self, feed_id: &str) -> Result<(), SyncError> {
        Ok(self.db().remove_feed(feed_id).await?)
    }

    async fn list_folders(&self) -> Result<Vec<Folder>, SyncError> {
        Ok(self.db().list_folders().await?)
    }

    async fn create_folder(&self, title: &str) -> Result<i64, SyncError> {
        Ok(self.db().create_folder(title).await?)
    }

    async fn rename_folder(&self, folder_id: i64, title: &str) -> Result<(), SyncError> {
        Ok(self.db().rename_folder(folder_id, title).await?)
    }

    async fn delete_folder(&self, folder_id: i64) -> Result<(), SyncError> {
        Ok(self.db().delete_folder(folder_id).await?)
    }

    async fn set_feed_folder(
        &self,
        feed_id: &str,
        folder_id: Option<i64>,
    ) -> Result<(), SyncError> {
        Ok(self.db().set_feed_folder(feed_id, folder_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn strategy() -> LocalStrategy {
        let db = Database::open(":memory:").await.unwrap();
        LocalStrategy::new(SyncEngine::new(db, reqwest::Client::new(), false))
    }

    #[tokio::test]
    async fn import_opml_is_supported() {
        let local = strategy().await;
        let count = local
            .import_opml(&[OpmlFeed {
                title: "A".into(),
                xml_url: "https://a.com/feed".into(),
                html_url: None,
                folder: Some("News".into()),
            }])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(local.list_feeds().await.unwrap().len(), 1);
        assert_eq!(local.list_folders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_feed_fetches_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Named Feed</title>
<item><guid>1</guid><title>Hello</title><pubDate>Mon, 15 Jan 2024 10:00:00 GMT</pubDate></item>
</channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let local = strategy().await;
        let url = format!("{}/feed", server.uri());
        let feed = local.add_feed(&url).await.unwrap();
        assert_eq!(feed.title, "Named Feed");

        let page = local
            .hydrate(&ArticleQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn status_flags_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>F</title>
<item><guid>x</guid><title>X</title><pubDate>Mon, 15 Jan 2024 10:00:00 GMT</pubDate></item>
</channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let local = strategy().await;
        local.add_feed(&format!("{}/feed", server.uri())).await.unwrap();

        let page = local.hydrate(&ArticleQuery::default()).await.unwrap();
        let id = page.articles[0].id.clone();

        local.set_read(&id, true).await.unwrap();
        local.set_saved(&id, true).await.unwrap();

        let article = local.get_article(&id).await.unwrap().unwrap();
        assert!(article.read);
        assert!(article.saved);
    }
}
