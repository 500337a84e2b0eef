//! Job queue CRUD and eligibility

use crate::error::Result;
use crate::types::{JobId, QueueItem};

use super::{QueueRow, Store};

impl Store {
    /// Insert a new job
    pub async fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue (
                id, file_name, job_name, category, nzb_contents, priority,
                pause_until, total_segment_bytes, post_processing, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.file_name)
        .bind(&item.job_name)
        .bind(&item.category)
        .bind(&item.nzb_contents)
        .bind(item.priority as i32)
        .bind(item.pause_until.map(|t| t.timestamp()))
        .bind(item.total_segment_bytes as i64)
        .bind(item.post_processing.to_i32())
        .bind(item.created_at.timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The eligible job the worker should run next, if any
    ///
    /// FIFO key is `(priority desc, created_at asc)`; rows with a future
    /// `pause_until` are skipped.
    pub async fn next_eligible(&self) -> Result<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, file_name, job_name, category, nzb_contents, priority,
                   pause_until, total_segment_bytes, post_processing, created_at
            FROM queue
            WHERE pause_until IS NULL OR pause_until <= ?
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(QueueItem::from))
    }

    /// Fetch one job by id
    pub async fn queue_item(&self, id: JobId) -> Result<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, file_name, job_name, category, nzb_contents, priority,
                   pause_until, total_segment_bytes, post_processing, created_at
            FROM queue WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(QueueItem::from))
    }

    /// List the whole queue in dispatch order
    pub async fn list_queue(&self) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, file_name, job_name, category, nzb_contents, priority,
                   pause_until, total_segment_bytes, post_processing, created_at
            FROM queue
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(QueueItem::from).collect())
    }

    /// Defer a job until `pause_until`
    pub async fn defer_queue_item(
        &self,
        id: JobId,
        pause_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE queue SET pause_until = ? WHERE id = ?")
            .bind(pause_until.timestamp())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete queue rows; returns how many existed
    pub async fn remove_queue_items(&self, ids: &[JobId]) -> Result<u64> {
        let mut removed = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM queue WHERE id = ?")
                .bind(id.to_string())
                .execute(self.pool())
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}
