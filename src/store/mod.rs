//! Virtual item store
//!
//! SQLite persistence for the virtual directory tree, segment runs, the job
//! queue, and history. The store owns VirtualItem/MultipartMeta lifecycle;
//! everything else holds ids.
//!
//! ## Submodules
//!
//! Methods on [`Store`] are organized by domain:
//! - [`migrations`] — lifecycle, schema migrations, well-known roots
//! - [`items`] — virtual tree CRUD, segment runs, job-tree transactions
//! - [`queue`] — job queue CRUD and eligibility
//! - [`history`] — history records and atomic job finalization

use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use std::str::FromStr;

use crate::types::{
    HistoryItem, ItemId, ItemType, JobId, JobStatus, MultipartMeta, PostProcessing, Priority,
    QueueItem, VirtualItem,
};

mod history;
mod items;
mod migrations;
mod queue;

pub use items::{JobTree, NewItem};

/// Handle to the SQLite-backed store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    roots: Roots,
}

/// Ids of the well-known root folders
#[derive(Clone, Copy, Debug)]
pub struct Roots {
    /// `content` — per-job directories by category
    pub content: ItemId,
    /// `symlinks` — importable video mirrored as symlink items
    pub symlinks: ItemId,
    /// `.ids` — items addressed by id (signed with the strm key)
    pub ids: ItemId,
}

impl Store {
    /// Well-known root folder ids
    pub fn roots(&self) -> Roots {
        self.roots
    }

    /// Underlying pool (crate-internal, for transactions)
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Virtual item row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ItemRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub item_type: i32,
    pub size: i64,
    pub created_at: i64,
    pub release_date: Option<i64>,
    pub last_health_check_at: Option<i64>,
}

impl From<ItemRow> for VirtualItem {
    fn from(row: ItemRow) -> Self {
        VirtualItem {
            id: parse_item_id(&row.id),
            parent_id: row.parent_id.as_deref().map(parse_item_id),
            name: row.name,
            item_type: ItemType::from_i32(row.item_type),
            size: row.size.max(0) as u64,
            created_at: timestamp(row.created_at),
            release_date: row.release_date.map(timestamp),
            last_health_check_at: row.last_health_check_at.map(timestamp),
        }
    }
}

/// Queue row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct QueueRow {
    pub id: String,
    pub file_name: String,
    pub job_name: String,
    pub category: String,
    pub nzb_contents: String,
    pub priority: i32,
    pub pause_until: Option<i64>,
    pub total_segment_bytes: i64,
    pub post_processing: i32,
    pub created_at: i64,
}

impl From<QueueRow> for QueueItem {
    fn from(row: QueueRow) -> Self {
        QueueItem {
            id: parse_job_id(&row.id),
            file_name: row.file_name,
            job_name: row.job_name,
            category: row.category,
            nzb_contents: row.nzb_contents,
            priority: Priority::from_i32(row.priority),
            pause_until: row.pause_until.map(timestamp),
            total_segment_bytes: row.total_segment_bytes.max(0) as u64,
            post_processing: PostProcessing::from_i32(row.post_processing),
            created_at: timestamp(row.created_at),
        }
    }
}

/// History row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct HistoryRow {
    pub id: String,
    pub job_name: String,
    pub category: String,
    pub status: i32,
    pub total_segment_bytes: i64,
    pub download_time_secs: i64,
    pub fail_message: Option<String>,
    pub download_dir_id: Option<String>,
    pub created_at: i64,
}

impl From<HistoryRow> for HistoryItem {
    fn from(row: HistoryRow) -> Self {
        HistoryItem {
            id: parse_job_id(&row.id),
            job_name: row.job_name,
            category: row.category,
            status: JobStatus::from_i32(row.status),
            total_segment_bytes: row.total_segment_bytes.max(0) as u64,
            download_time_seconds: row.download_time_secs.max(0) as u64,
            fail_message: row.fail_message,
            download_dir_id: row.download_dir_id.as_deref().map(parse_item_id),
            created_at: timestamp(row.created_at),
        }
    }
}

/// Serialized MultipartMeta column
#[derive(Debug, Clone, FromRow)]
pub(crate) struct MetaRow {
    pub multipart_meta: Option<String>,
}

impl MetaRow {
    pub(crate) fn parse(self) -> Option<MultipartMeta> {
        self.multipart_meta
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

fn parse_item_id(raw: &str) -> ItemId {
    ItemId::from_str(raw).unwrap_or_else(|_| {
        tracing::warn!(raw, "corrupt item id in store");
        ItemId(uuid::Uuid::nil())
    })
}

fn parse_job_id(raw: &str) -> JobId {
    JobId::from_str(raw).unwrap_or_else(|_| {
        tracing::warn!(raw, "corrupt job id in store");
        JobId(uuid::Uuid::nil())
    })
}

fn timestamp(secs: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    chrono::Utc
        .timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}
