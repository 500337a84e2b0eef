//! Store lifecycle and schema migrations

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::{ItemId, ItemType};
use crate::utils::{CONTENT_ROOT, IDS_ROOT, SYMLINKS_ROOT};

use super::{Roots, Store};

impl Store {
    /// Open (or create) the store at `path` and run migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(Error::Database)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        Self::init(pool).await
    }

    /// Open an in-memory store (tests)
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(Error::Database)?
            .foreign_keys(true);
        // One connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        run_migrations(&pool).await?;
        let roots = ensure_roots(&pool).await?;
        Ok(Self { pool, roots })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    if current < 1 {
        apply_v1(pool).await?;
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(chrono::Utc::now().timestamp())
            .execute(pool)
            .await?;
        tracing::info!("store schema migrated to version 1");
    }

    Ok(())
}

async fn apply_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES items(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            item_type INTEGER NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            release_date INTEGER,
            last_health_check_at INTEGER,
            multipart_meta TEXT,
            inline_data BLOB,
            symlink_target TEXT,
            UNIQUE (parent_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
            part_number INTEGER NOT NULL,
            message_id TEXT NOT NULL,
            part_offset INTEGER NOT NULL,
            part_size INTEGER NOT NULL,
            PRIMARY KEY (item_id, part_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            job_name TEXT NOT NULL,
            category TEXT NOT NULL,
            nzb_contents TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            pause_until INTEGER,
            total_segment_bytes INTEGER NOT NULL DEFAULT 0,
            post_processing INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history (
            id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            category TEXT NOT NULL,
            status INTEGER NOT NULL,
            total_segment_bytes INTEGER NOT NULL DEFAULT 0,
            download_time_secs INTEGER NOT NULL DEFAULT 0,
            fail_message TEXT,
            download_dir_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the well-known roots when absent and return their ids
async fn ensure_roots(pool: &SqlitePool) -> Result<Roots> {
    let content = ensure_root(pool, CONTENT_ROOT).await?;
    let symlinks = ensure_root(pool, SYMLINKS_ROOT).await?;
    let ids = ensure_root(pool, IDS_ROOT).await?;
    Ok(Roots {
        content,
        symlinks,
        ids,
    })
}

async fn ensure_root(pool: &SqlitePool, name: &str) -> Result<ItemId> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM items WHERE parent_id IS NULL AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    if let Some(raw) = existing {
        return Ok(super::parse_item_id(&raw));
    }

    let id = ItemId::new();
    sqlx::query(
        r#"
        INSERT INTO items (id, parent_id, name, item_type, size, created_at)
        VALUES (?, NULL, ?, ?, 0, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .bind(ItemType::Dir.to_i32())
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}
