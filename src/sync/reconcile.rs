use std::collections::HashSet;

use anyhow::Result;

use crate::storage::Database;

/// One article's authoritative status after a full-set reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusAssignment {
    pub article_id: String,
    pub read: bool,
    pub saved: bool,
}

/// Computes authoritative read/saved flags for every cached article from the
/// remote's complete unread and saved ID sets.
///
/// Membership in the unread set is the only thing that makes an article
/// unread; membership in the saved set is the only thing that makes it saved.
/// Everything else is read and unsaved, which is how remote-side changes made
/// elsewhere (including un-saving) propagate here.
pub fn reconcile(
    cached_ids: &[String],
    unread_ids: &HashSet<String>,
    saved_ids: &HashSet<String>,
) -> Vec<StatusAssignment> {
    cached_ids
        .iter()
        .map(|id| StatusAssignment {
            article_id: id.clone(),
            read: !unread_ids.contains(id),
            saved: saved_ids.contains(id),
        })
        .collect()
}

/// Applies a reconciliation in one transaction so a partial failure cannot
/// leave the cache with a mix of old and new statuses.
pub async fn apply_assignments(db: &Database, assignments: &[StatusAssignment]) -> Result<()> {
    if assignments.is_empty() {
        return Ok(());
    }
    let mut tx = db.pool.begin().await?;
    for assignment in assignments {
        sqlx::query(
            r#"
            INSERT INTO article_status (article_id, read, saved) VALUES (?, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET read = excluded.read, saved = excluded.saved
        "#,
        )
        .bind(&assignment.article_id)
        .bind(assignment.read)
        .bind(assignment.saved)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
