//! History records and atomic job finalization

use crate::error::Result;
use crate::types::{HistoryItem, JobStatus};

use super::{HistoryRow, Store};

impl Store {
    /// Remove a job's queue row and insert its history record atomically
    ///
    /// Success and failure both land here; the only difference is the
    /// record's status and whether a mount folder id is present.
    pub async fn finalize_job(&self, history: &HistoryItem) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(history.id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO history (
                id, job_name, category, status, total_segment_bytes,
                download_time_secs, fail_message, download_dir_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(history.id.to_string())
        .bind(&history.job_name)
        .bind(&history.category)
        .bind(history.status.to_i32())
        .bind(history.total_segment_bytes as i64)
        .bind(history.download_time_seconds as i64)
        .bind(history.fail_message.as_deref())
        .bind(history.download_dir_id.map(|id| id.to_string()))
        .bind(history.created_at.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Query history, newest first, with optional status filter and paging
    pub async fn list_history(
        &self,
        status_filter: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryItem>> {
        let query = if let Some(status) = status_filter {
            sqlx::query_as::<_, HistoryRow>(
                r#"
                SELECT id, job_name, category, status, total_segment_bytes,
                       download_time_secs, fail_message, download_dir_id, created_at
                FROM history
                WHERE status = ?
                ORDER BY created_at DESC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(status.to_i32())
            .bind(limit as i64)
            .bind(offset as i64)
        } else {
            sqlx::query_as::<_, HistoryRow>(
                r#"
                SELECT id, job_name, category, status, total_segment_bytes,
                       download_time_secs, fail_message, download_dir_id, created_at
                FROM history
                ORDER BY created_at DESC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(limit as i64)
            .bind(offset as i64)
        };

        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(HistoryItem::from).collect())
    }

    /// Count history rows matching the filter
    pub async fn count_history(&self, status_filter: Option<JobStatus>) -> Result<i64> {
        let count = if let Some(status) = status_filter {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM history WHERE status = ?")
                .bind(status.to_i32())
                .fetch_one(self.pool())
                .await?
        } else {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM history")
                .fetch_one(self.pool())
                .await?
        };
        Ok(count)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, PostProcessing, Priority, QueueItem};
    use chrono::Utc;

    fn history(id: JobId, name: &str, status: JobStatus) -> HistoryItem {
        HistoryItem {
            id,
            job_name: name.to_string(),
            category: "movies".to_string(),
            status,
            total_segment_bytes: 1234,
            download_time_seconds: 7,
            fail_message: match status {
                JobStatus::Failed => Some("boom".to_string()),
                JobStatus::Completed => None,
            },
            download_dir_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finalize_removes_queue_row_and_writes_history() {
        let store = Store::open_in_memory().await.unwrap();
        let item = QueueItem {
            id: JobId::new(),
            file_name: "a.nzb".into(),
            job_name: "a".into(),
            category: "movies".into(),
            nzb_contents: "<nzb/>".into(),
            priority: Priority::Normal,
            pause_until: None,
            total_segment_bytes: 1,
            post_processing: PostProcessing::Skip,
            created_at: Utc::now(),
        };
        store.insert_queue_item(&item).await.unwrap();

        store
            .finalize_job(&history(item.id, "a", JobStatus::Completed))
            .await
            .unwrap();

        assert!(store.queue_item(item.id).await.unwrap().is_none());
        let rows = store.list_history(None, 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, item.id, "history reuses the queue id");
        assert_eq!(rows[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn list_history_filters_by_status() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .finalize_job(&history(JobId::new(), "ok", JobStatus::Completed))
            .await
            .unwrap();
        store
            .finalize_job(&history(JobId::new(), "bad", JobStatus::Failed))
            .await
            .unwrap();

        let failed = store
            .list_history(Some(JobStatus::Failed), 0, 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_name, "bad");
        assert_eq!(failed[0].fail_message.as_deref(), Some("boom"));

        assert_eq!(store.count_history(None).await.unwrap(), 2);
        assert_eq!(
            store.count_history(Some(JobStatus::Completed)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn pagination_window() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            let mut h = history(JobId::new(), &format!("job{i}"), JobStatus::Completed);
            h.created_at = Utc::now() - chrono::Duration::seconds(10 - i);
            store.finalize_job(&h).await.unwrap();
        }
        let page = store.list_history(None, 1, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        // Newest first: job4 is newest, page offset 1 starts at job3
        assert_eq!(page[0].job_name, "job3");
        assert_eq!(page[1].job_name, "job2");
    }
}
