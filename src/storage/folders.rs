use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Folder;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    fn validate_title(title: &str) -> Result<String> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            bail!("Folder title cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// All folders, ordered by title.
    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT id, title, created_at FROM folders ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// Create a folder, returning its id. Empty titles are rejected.
    pub async fn create_folder(&self, title: &str) -> Result<i64> {
        let clean = Self::validate_title(title)?;
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) =
            sqlx::query_as("INSERT INTO folders (title, created_at) VALUES (?, ?) RETURNING id")
                .bind(&clean)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Insert or update folders with known ids (remote account sync).
    pub async fn upsert_folders(&self, folders: &[Folder]) -> Result<()> {
        if folders.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for folder in folders {
            sqlx::query(
                r#"
                INSERT INTO folders (id, title, created_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET title = excluded.title
            "#,
            )
            .bind(folder.id)
            .bind(&folder.title)
            .bind(folder.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rename a folder. Empty titles are rejected.
    pub async fn rename_folder(&self, folder_id: i64, title: &str) -> Result<()> {
        let clean = Self::validate_title(title)?;
        sqlx::query("UPDATE folders SET title = ? WHERE id = ?")
            .bind(&clean)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a folder. Its feeds are unassigned, not deleted.
    pub async fn delete_folder(&self, folder_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE feeds SET folder_id = NULL WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Assign a feed to a folder, or to none.
    pub async fn set_feed_folder(&self, feed_id: &str, folder_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE feeds SET folder_id = ? WHERE id = ?")
            .bind(folder_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Feed;
    use crate::util::derive_id;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_rejects_blank_titles() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.create_folder("").await.is_err());
        assert!(db.create_folder("   ").await.is_err());
        assert!(db.create_folder("News").await.is_ok());
    }

    #[tokio::test]
    async fn delete_unassigns_feeds() {
        let db = Database::open(":memory:").await.unwrap();
        let folder_id = db.create_folder("Tech").await.unwrap();

        let feed = Feed {
            id: derive_id("https://a.com/feed"),
            title: "Alpha".into(),
            url: "https://a.com/feed".into(),
            description: None,
            image: None,
            html_url: None,
            last_updated: None,
            folder_id: Some(folder_id),
            last_published_at: None,
            last_published_ts: None,
            expires_ts: None,
            etag: None,
            last_modified: None,
        };
        let fid = feed.id.clone();
        db.upsert_feeds(&[feed]).await.unwrap();

        db.delete_folder(folder_id).await.unwrap();

        let stored = db.get_feed(&fid).await.unwrap().unwrap();
        assert_eq!(stored.folder_id, None);
        assert!(db.list_folders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_and_reassign() {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.create_folder("Tech").await.unwrap();
        db.rename_folder(id, "Technology").await.unwrap();

        let folders = db.list_folders().await.unwrap();
        assert_eq!(folders[0].title, "Technology");
    }
}
