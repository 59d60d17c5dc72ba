use std::collections::HashMap;

use anyhow::Result;

use super::schema::Database;
use super::types::{Article, ArticlePage, ArticleQuery, ArticleRow, NewArticle};

/// Columns selected for every article query, status flags LEFT JOINed in.
const ARTICLE_SELECT: &str = r#"
    SELECT a.id, a.feed_id, a.remote_id, a.title, a.link, a.source,
           a.published_at, a.updated_at, a.description, a.content,
           a.thumbnail, a.sort_ts, s.read, s.saved
    FROM articles a
    LEFT JOIN article_status s ON s.article_id = a.id
"#;

impl Database {
    // ========================================================================
    // Article Upserts
    // ========================================================================

    /// Idempotent upsert of article content; returns the number of genuinely
    /// new articles inserted.
    ///
    /// Two-phase within one transaction: INSERT OR IGNORE captures new rows
    /// (counted via `rows_affected`), then an UPDATE refreshes content fields
    /// for rows that already existed. Status rows are created with defaults
    /// for new articles only; existing read/saved flags are never touched,
    /// so a routine content re-sync cannot downgrade a saved article.
    pub async fn upsert_articles(&self, articles: &[NewArticle]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for article in articles {
            let sort_ts = article.effective_ts();

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO articles
                    (id, feed_id, remote_id, title, link, source, published_at,
                     updated_at, description, content, thumbnail, sort_ts, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&article.id)
            .bind(&article.feed_id)
            .bind(article.remote_id)
            .bind(&article.title)
            .bind(&article.link)
            .bind(&article.source)
            .bind(&article.published_at)
            .bind(&article.updated_at)
            .bind(&article.description)
            .bind(&article.content)
            .bind(&article.thumbnail)
            .bind(sort_ts)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                // Existing row: refresh content, keep fetched_at (first seen)
                sqlx::query(
                    r#"
                    UPDATE articles SET
                        title = ?, link = ?, source = ?, published_at = ?,
                        updated_at = ?, description = ?, content = ?,
                        thumbnail = coalesce(?, thumbnail), sort_ts = ?
                    WHERE id = ?
                "#,
                )
                .bind(&article.title)
                .bind(&article.link)
                .bind(&article.source)
                .bind(&article.published_at)
                .bind(&article.updated_at)
                .bind(&article.description)
                .bind(&article.content)
                .bind(&article.thumbnail)
                .bind(sort_ts)
                .bind(&article.id)
                .execute(&mut *tx)
                .await?;
            }

            // Default status row for new articles; a no-op when one exists
            sqlx::query("INSERT OR IGNORE INTO article_status (article_id) VALUES (?)")
                .bind(&article.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Articles for one feed, or every article when `feed_id` is `None`,
    /// newest first.
    pub async fn list_articles_by_feed(&self, feed_id: Option<&str>) -> Result<Vec<Article>> {
        let rows = match feed_id {
            Some(fid) => {
                let sql = format!("{ARTICLE_SELECT} WHERE a.feed_id = ? ORDER BY a.sort_ts DESC, a.fetched_at DESC");
                sqlx::query_as::<_, ArticleRow>(&sql)
                    .bind(fid)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{ARTICLE_SELECT} ORDER BY a.sort_ts DESC, a.fetched_at DESC");
                sqlx::query_as::<_, ArticleRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// A single article by id.
    pub async fn get_article(&self, article_id: &str) -> Result<Option<Article>> {
        let sql = format!("{ARTICLE_SELECT} WHERE a.id = ?");
        let row = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ArticleRow::into_article))
    }

    /// Filtered, paged listing with an unpaged total.
    pub async fn list_page(&self, query: &ArticleQuery) -> Result<ArticlePage> {
        let page_size = i64::from(query.page_size.max(1));
        let offset = i64::from(query.page) * page_size;

        let mut clauses: Vec<&str> = Vec::new();
        if query.feed_id.is_some() {
            clauses.push("a.feed_id = ?");
        }
        if query.unread_only {
            clauses.push("coalesce(s.read, 0) = 0");
        }
        if query.saved_only {
            clauses.push("coalesce(s.saved, 0) = 1");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!(
            "SELECT COUNT(*) FROM articles a LEFT JOIN article_status s ON s.article_id = a.id{where_sql}"
        );
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        if let Some(fid) = &query.feed_id {
            count_query = count_query.bind(fid);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            "{ARTICLE_SELECT}{where_sql} ORDER BY a.sort_ts DESC, a.fetched_at DESC LIMIT ? OFFSET ?"
        );
        let mut page_query = sqlx::query_as::<_, ArticleRow>(&page_sql);
        if let Some(fid) = &query.feed_id {
            page_query = page_query.bind(fid);
        }
        let rows = page_query
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(ArticlePage {
            articles: rows.into_iter().map(ArticleRow::into_article).collect(),
            total,
        })
    }

    /// Ids of every cached article; input to bulk status reconciliation.
    pub async fn all_article_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM articles")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Unread article counts grouped by feed.
    pub async fn unread_counts_by_feed(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT a.feed_id, COUNT(*)
            FROM articles a
            LEFT JOIN article_status s ON s.article_id = a.id
            WHERE a.feed_id IS NOT NULL AND coalesce(s.read, 0) = 0
            GROUP BY a.feed_id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ========================================================================
    // Status Mutations
    // ========================================================================

    /// Explicit read/unread write for one article.
    pub async fn set_read(&self, article_id: &str, read: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO article_status (article_id, read) VALUES (?, ?)
            ON CONFLICT(article_id) DO UPDATE SET read = excluded.read
        "#,
        )
        .bind(article_id)
        .bind(read)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Explicit saved/unsaved write for one article. This is the only path
    /// that may lower the saved flag.
    pub async fn set_saved(&self, article_id: &str, saved: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO article_status (article_id, saved) VALUES (?, ?)
            ON CONFLICT(article_id) DO UPDATE SET saved = excluded.saved
        "#,
        )
        .bind(article_id)
        .bind(saved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk read flag write, atomic across the whole id list.
    pub async fn set_many_read(&self, article_ids: &[String], read: bool) -> Result<()> {
        if article_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in article_ids {
            sqlx::query(
                r#"
                INSERT INTO article_status (article_id, read) VALUES (?, ?)
                ON CONFLICT(article_id) DO UPDATE SET read = excluded.read
            "#,
            )
            .bind(id)
            .bind(read)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mark everything read, optionally scoped to one feed. Returns the
    /// number of articles affected.
    pub async fn set_all_read(&self, feed_id: Option<&str>) -> Result<u64> {
        let result = match feed_id {
            Some(fid) => {
                sqlx::query(
                    r#"
                    INSERT INTO article_status (article_id, read)
                    SELECT id, 1 FROM articles WHERE feed_id = ?
                    ON CONFLICT(article_id) DO UPDATE SET read = 1
                "#,
                )
                .bind(fid)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO article_status (article_id, read)
                    SELECT id, 1 FROM articles
                    ON CONFLICT(article_id) DO UPDATE SET read = 1
                "#,
                )
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Delete articles whose sort timestamp is positive and below the cutoff.
    /// Articles with an unknown (zero) timestamp are never pruned here.
    pub async fn delete_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM articles WHERE sort_ts > 0 AND sort_ts < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
