use anyhow::Result;

use super::schema::Database;
use super::types::{ArticlePage, ArticleRow};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;

/// Validate FTS5 query complexity to prevent expensive wildcard expansions.
fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        );
    }

    if query.matches('*').count() > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    if query.to_uppercase().matches(" OR ").count() > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    Ok(())
}

/// Paged full-text search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub feed_id: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Full-text search over title + body with a substring fallback.
    ///
    /// FTS5 MATCH is tried first; if the index rejects the query (syntax) or
    /// is unavailable, the search degrades to a LIKE scan over title and
    /// description so the feature keeps working.
    pub async fn search_page(&self, search: &SearchQuery) -> Result<ArticlePage> {
        let query = search.query.trim();
        if query.is_empty() {
            return Ok(ArticlePage {
                articles: Vec::new(),
                total: 0,
            });
        }
        validate_fts_query(query)?;

        let page_size = i64::from(search.page_size.max(1));
        let offset = i64::from(search.page) * page_size;

        let feed_clause = if search.feed_id.is_some() {
            " AND a.feed_id = ?"
        } else {
            ""
        };

        let count_sql = format!(
            r#"
            SELECT COUNT(*)
            FROM articles a
            INNER JOIN articles_fts f ON f.article_id = a.id
            WHERE articles_fts MATCH ?{feed_clause}
        "#
        );
        let page_sql = format!(
            r#"
            SELECT a.id, a.feed_id, a.remote_id, a.title, a.link, a.source,
                   a.published_at, a.updated_at, a.description, a.content,
                   a.thumbnail, a.sort_ts, s.read, s.saved
            FROM articles a
            INNER JOIN articles_fts f ON f.article_id = a.id
            LEFT JOIN article_status s ON s.article_id = a.id
            WHERE articles_fts MATCH ?{feed_clause}
            ORDER BY a.sort_ts DESC
            LIMIT ? OFFSET ?
        "#
        );

        let fts_total = {
            let mut q = sqlx::query_as::<_, (i64,)>(&count_sql).bind(query);
            if let Some(fid) = &search.feed_id {
                q = q.bind(fid);
            }
            q.fetch_one(&self.pool).await
        };

        match fts_total {
            Ok((total,)) => {
                let mut q = sqlx::query_as::<_, ArticleRow>(&page_sql).bind(query);
                if let Some(fid) = &search.feed_id {
                    q = q.bind(fid);
                }
                let rows = q.bind(page_size).bind(offset).fetch_all(&self.pool).await?;
                Ok(ArticlePage {
                    articles: rows.into_iter().map(ArticleRow::into_article).collect(),
                    total,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
                self.search_page_like(query, search, page_size, offset).await
            }
        }
    }

    async fn search_page_like(
        &self,
        query: &str,
        search: &SearchQuery,
        page_size: i64,
        offset: i64,
    ) -> Result<ArticlePage> {
        let pattern = format!("%{}%", query);
        let feed_clause = if search.feed_id.is_some() {
            " AND a.feed_id = ?"
        } else {
            ""
        };

        // Placeholders stay uniformly anonymous (the pattern is bound twice);
        // mixing numbered and anonymous markers shifts sqlite's bind cursor.
        let count_sql = format!(
            "SELECT COUNT(*) FROM articles a WHERE (a.title LIKE ? OR a.description LIKE ?){feed_clause}"
        );
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql)
            .bind(&pattern)
            .bind(&pattern);
        if let Some(fid) = &search.feed_id {
            count_query = count_query.bind(fid);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            r#"
            SELECT a.id, a.feed_id, a.remote_id, a.title, a.link, a.source,
                   a.published_at, a.updated_at, a.description, a.content,
                   a.thumbnail, a.sort_ts, s.read, s.saved
            FROM articles a
            LEFT JOIN article_status s ON s.article_id = a.id
            WHERE (a.title LIKE ? OR a.description LIKE ?){feed_clause}
            ORDER BY a.sort_ts DESC
            LIMIT ? OFFSET ?
        "#
        );
        let mut page_query = sqlx::query_as::<_, ArticleRow>(&page_sql)
            .bind(&pattern)
            .bind(&pattern);
        if let Some(fid) = &search.feed_id {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Feed, NewArticle};
    use crate::util::derive_id;
    use pretty_assertions::assert_eq;

    async fn seeded_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        let feed = Feed {
            id: derive_id("https://a.com/feed"),
            title: "Alpha".into(),
            url: "https://a.com/feed".into(),
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
        let fid = feed.id.clone();
        db.upsert_feeds(&[feed]).await.unwrap();
        db.upsert_articles(&[
            NewArticle {
                id: derive_id("g1"),
                feed_id: Some(fid.clone()),
                remote_id: None,
                title: "Rust async patterns".into(),
                link: None,
                source: None,
                published_at: Some("2024-01-15T10:00:00Z".into()),
                updated_at: None,
                description: Some("tokio and futures".into()),
                content: None,
                thumbnail: None,
            },
            NewArticle {
                id: derive_id("g2"),
                feed_id: Some(fid.clone()),
                remote_id: None,
                title: "Gardening weekly".into(),
                link: None,
                source: None,
                published_at: Some("2024-01-16T10:00:00Z".into()),
                updated_at: None,
                description: Some("tomatoes".into()),
                content: None,
                thumbnail: None,
            },
            NewArticle {
                id: derive_id("g3"),
                feed_id: Some(fid.clone()),
                remote_id: None,
                title: "Press review".into(),
                link: None,
                source: None,
                published_at: Some("2024-01-17T10:00:00Z".into()),
                updated_at: None,
                description: Some("he said \"misquoted\" twice".into()),
                content: None,
                thumbnail: None,
            },
            NewArticle {
                id: derive_id("g4"),
                feed_id: Some(fid),
                remote_id: None,
                title: "Language notes".into(),
                link: None,
                source: None,
                published_at: Some("2024-01-18T10:00:00Z".into()),
                updated_at: None,
                description: Some("short summary".into()),
                content: Some("<p>a deep dive into borrowing</p>".into()),
                thumbnail: None,
            },
        ])
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn fts_matches_title_and_body() {
        let db = seeded_db().await;
        let page = db
            .search_page(&SearchQuery {
                query: "rust".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.articles[0].id, derive_id("g1"));

        let body_hit = db
            .search_page(&SearchQuery {
                query: "tomatoes".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(body_hit.total, 1);
    }

    #[tokio::test]
    async fn malformed_fts_query_falls_back_to_like() {
        let db = seeded_db().await;
        // Unbalanced quote is invalid FTS5 syntax but works as a substring
        let page = db
            .search_page(&SearchQuery {
                query: "\"rust".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        // LIKE on %"rust% finds nothing, but the call must not error
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn like_fallback_still_finds_substring_matches() {
        let db = seeded_db().await;
        // Unbalanced quote: FTS5 rejects it, but the quoted word exists
        // verbatim in one description, so the substring scan finds it
        let page = db
            .search_page(&SearchQuery {
                query: "\"misquoted\"".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert!(page.total >= 1);

        let unbalanced = db
            .search_page(&SearchQuery {
                query: "\"misquoted".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(unbalanced.total, 1);
        assert_eq!(unbalanced.articles[0].id, derive_id("g3"));
    }

    #[tokio::test]
    async fn content_body_is_indexed_alongside_description() {
        let db = seeded_db().await;
        // "borrowing" appears only in the article's content, and the article
        // also has a description; both must land in the search body
        let page = db
            .search_page(&SearchQuery {
                query: "borrowing".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.articles[0].id, derive_id("g4"));
    }

    #[tokio::test]
    async fn empty_query_returns_empty_page() {
        let db = seeded_db().await;
        let page = db
            .search_page(&SearchQuery {
                query: "   ".into(),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.articles.is_empty());
    }

    #[tokio::test]
    async fn overlong_query_rejected() {
        let db = seeded_db().await;
        let result = db
            .search_page(&SearchQuery {
                query: "a".repeat(300),
                feed_id: None,
                page: 0,
                page_size: 10,
            })
            .await;
        assert!(result.is_err());
    }
}
