use anyhow::Result;

use super::schema::Database;
use super::types::Feed;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// All feeds, ordered by title.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, title, url, description, image, html_url, last_updated,
                   folder_id, last_published_at, last_published_ts, expires_ts,
                   etag, last_modified
            FROM feeds
            ORDER BY title
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// A single feed by id.
    pub async fn get_feed(&self, feed_id: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, title, url, description, image, html_url, last_updated,
                   folder_id, last_published_at, last_published_ts, expires_ts,
                   etag, last_modified
            FROM feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Merge-upsert a batch of feeds in one transaction.
    ///
    /// Descriptive fields are overwritten from the incoming value; freshness
    /// fields (`last_published_*`, `expires_ts`, `etag`, `last_modified`) and
    /// the folder assignment are only overwritten when the incoming value is
    /// non-null, so a refresh that learned nothing new does not erase state.
    pub async fn upsert_feeds(&self, feeds: &[Feed]) -> Result<()> {
        if feeds.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for feed in feeds {
            sqlx::query(
                r#"
                INSERT INTO feeds (id, title, url, description, image, html_url,
                                   last_updated, folder_id, last_published_at,
                                   last_published_ts, expires_ts, etag, last_modified)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    url = excluded.url,
                    description = coalesce(excluded.description, feeds.description),
                    image = coalesce(excluded.image, feeds.image),
                    html_url = coalesce(excluded.html_url, feeds.html_url),
                    last_updated = coalesce(excluded.last_updated, feeds.last_updated),
                    folder_id = coalesce(excluded.folder_id, feeds.folder_id),
                    last_published_at = coalesce(excluded.last_published_at, feeds.last_published_at),
                    last_published_ts = coalesce(excluded.last_published_ts, feeds.last_published_ts),
                    expires_ts = coalesce(excluded.expires_ts, feeds.expires_ts),
                    etag = coalesce(excluded.etag, feeds.etag),
                    last_modified = coalesce(excluded.last_modified, feeds.last_modified)
            "#,
            )
            .bind(&feed.id)
            .bind(&feed.title)
            .bind(&feed.url)
            .bind(&feed.description)
            .bind(&feed.image)
            .bind(&feed.html_url)
            .bind(&feed.last_updated)
            .bind(feed.folder_id)
            .bind(&feed.last_published_at)
            .bind(feed.last_published_ts)
            .bind(feed.expires_ts)
            .bind(&feed.etag)
            .bind(&feed.last_modified)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a feed; its articles go with it (FK cascade).
    pub async fn remove_feed(&self, feed_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::derive_id;
    use pretty_assertions::assert_eq;

    fn feed(url: &str, title: &str) -> Feed {
        Feed {
            id: derive_id(url),
            title: title.to_string(),
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
        }
    }

    #[tokio::test]
    async fn upsert_then_list() {
        let db = Database::open(":memory:").await.unwrap();
        db.upsert_feeds(&[
            feed("https://b.com/feed", "Beta"),
            feed("https://a.com/feed", "Alpha"),
        ])
        .await
        .unwrap();

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].title, "Alpha");
        assert_eq!(feeds[1].title, "Beta");
    }

    #[tokio::test]
    async fn null_freshness_fields_do_not_overwrite() {
        let db = Database::open(":memory:").await.unwrap();

        let mut first = feed("https://a.com/feed", "Alpha");
        first.last_published_ts = Some(2000);
        first.etag = Some("\"v1\"".to_string());
        db.upsert_feeds(&[first]).await.unwrap();

        // A later upsert with no freshness info keeps the stored values
        let second = feed("https://a.com/feed", "Alpha renamed");
        db.upsert_feeds(&[second]).await.unwrap();

        let stored = db
            .get_feed(&derive_id("https://a.com/feed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "Alpha renamed");
        assert_eq!(stored.last_published_ts, Some(2000));
        assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn remove_feed_cascades_to_articles() {
        let db = Database::open(":memory:").await.unwrap();
        let f = feed("https://a.com/feed", "Alpha");
        let fid = f.id.clone();
        db.upsert_feeds(&[f]).await.unwrap();

        db.upsert_articles(&[crate::storage::NewArticle {
            id: derive_id("guid-1"),
            feed_id: Some(fid.clone()),
            remote_id: None,
            title: "One".into(),
            link: None,
            source: None,
            published_at: None,
            updated_at: None,
            description: None,
            content: None,
            thumbnail: None,
        }])
        .await
        .unwrap();

        db.remove_feed(&fid).await.unwrap();
        let remaining = db.list_articles_by_feed(Some(&fid)).await.unwrap();
        assert!(remaining.is_empty());
    }
}
