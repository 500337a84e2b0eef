//! Virtual tree CRUD, segment runs, and the per-job insert transaction

use crate::error::{Error, Result};
use crate::types::{ItemId, ItemType, MultipartMeta, SegmentRef, VirtualItem};

use super::{ItemRow, MetaRow, Store};

/// A fully described item staged for insertion
#[derive(Clone, Debug)]
pub struct NewItem {
    /// The item itself (id and parent assigned by the pipeline)
    pub item: VirtualItem,
    /// Segment run for `File` items
    pub segments: Vec<SegmentRef>,
    /// Multipart metadata for `MultipartFile` items
    pub multipart: Option<MultipartMeta>,
    /// Literal content (`.strm` files)
    pub inline_data: Option<Vec<u8>>,
    /// Target path for `Symlink` items
    pub symlink_target: Option<String>,
}

impl NewItem {
    /// Plain item with no attachments
    pub fn bare(item: VirtualItem) -> Self {
        Self {
            item,
            segments: Vec::new(),
            multipart: None,
            inline_data: None,
            symlink_target: None,
        }
    }
}

/// Everything a finished job inserts in one transaction
#[derive(Clone, Debug, Default)]
pub struct JobTree {
    /// Items in parent-before-child order
    pub items: Vec<NewItem>,
}

impl Store {
    /// Find a child by name
    pub async fn lookup(&self, parent_id: ItemId, name: &str) -> Result<Option<VirtualItem>> {
        let row: Option<ItemRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, name, item_type, size, created_at,
                   release_date, last_health_check_at
            FROM items WHERE parent_id = ? AND name = ?
            "#,
        )
        .bind(parent_id.to_string())
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(VirtualItem::from))
    }

    /// List a directory's children ordered by name
    pub async fn children(&self, parent_id: ItemId) -> Result<Vec<VirtualItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, name, item_type, size, created_at,
                   release_date, last_health_check_at
            FROM items WHERE parent_id = ? ORDER BY name
            "#,
        )
        .bind(parent_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(VirtualItem::from).collect())
    }

    /// Fetch an item by id
    pub async fn item(&self, id: ItemId) -> Result<Option<VirtualItem>> {
        let row: Option<ItemRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, name, item_type, size, created_at,
                   release_date, last_health_check_at
            FROM items WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(VirtualItem::from))
    }

    /// Ordered segment run of a `File` item
    pub async fn segments(&self, item_id: ItemId) -> Result<Vec<SegmentRef>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            message_id: String,
            part_number: i64,
            part_offset: i64,
            part_size: i64,
        }
        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT message_id, part_number, part_offset, part_size
            FROM segments WHERE item_id = ? ORDER BY part_number
            "#,
        )
        .bind(item_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SegmentRef {
                message_id: r.message_id,
                part_number: r.part_number.max(0) as u32,
                part_offset: r.part_offset.max(0) as u64,
                part_size: r.part_size.max(0) as u64,
            })
            .collect())
    }

    /// Multipart metadata of a `MultipartFile` item
    pub async fn multipart_meta(&self, item_id: ItemId) -> Result<Option<MultipartMeta>> {
        let row: Option<MetaRow> =
            sqlx::query_as("SELECT multipart_meta FROM items WHERE id = ?")
                .bind(item_id.to_string())
                .fetch_optional(self.pool())
                .await?;
        Ok(row.and_then(MetaRow::parse))
    }

    /// Literal content of an inline item (`.strm`)
    pub async fn inline_data(&self, item_id: ItemId) -> Result<Option<Vec<u8>>> {
        let data: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT inline_data FROM items WHERE id = ?")
                .bind(item_id.to_string())
                .fetch_optional(self.pool())
                .await?;
        Ok(data.flatten())
    }

    /// Target of a symlink item
    pub async fn symlink_target(&self, item_id: ItemId) -> Result<Option<String>> {
        let target: Option<Option<String>> =
            sqlx::query_scalar("SELECT symlink_target FROM items WHERE id = ?")
                .bind(item_id.to_string())
                .fetch_optional(self.pool())
                .await?;
        Ok(target.flatten())
    }

    /// Virtual path of an item, e.g. `content/movies/Movie/file.mkv`
    pub async fn item_path(&self, id: ItemId) -> Result<String> {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        // Bounded walk; the tree is shallow but a corrupt parent loop must
        // not hang the adapter
        for _ in 0..64 {
            let Some(current) = cursor else { break };
            let Some(item) = self.item(current).await? else {
                return Err(Error::NotFound(format!("item {current}")));
            };
            parts.push(item.name);
            cursor = item.parent_id;
        }
        if cursor.is_some() {
            return Err(Error::Validation("item tree deeper than 64 levels".into()));
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    /// Mark items as covered by a health sweep
    pub async fn touch_health_check(&self, item_ids: &[ItemId]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for id in item_ids {
            sqlx::query("UPDATE items SET last_health_check_at = ? WHERE id = ?")
                .bind(now)
                .bind(id.to_string())
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Insert a finished job's whole tree in one transaction
    ///
    /// Items must be ordered parent-before-child. Nothing is visible to
    /// readers until the commit; an error rolls everything back, which is
    /// what discards a cancelled job's staged writes.
    pub async fn insert_job_tree(&self, tree: &JobTree) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for new_item in &tree.items {
            let item = &new_item.item;
            let meta_json = match &new_item.multipart {
                Some(meta) => Some(serde_json::to_string(meta)?),
                None => None,
            };
            sqlx::query(
                r#"
                INSERT INTO items (
                    id, parent_id, name, item_type, size, created_at,
                    release_date, last_health_check_at, multipart_meta,
                    inline_data, symlink_target
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(item.parent_id.map(|p| p.to_string()))
            .bind(&item.name)
            .bind(item.item_type.to_i32())
            .bind(item.size as i64)
            .bind(item.created_at.timestamp())
            .bind(item.release_date.map(|d| d.timestamp()))
            .bind(item.last_health_check_at.map(|d| d.timestamp()))
            .bind(meta_json)
            .bind(new_item.inline_data.as_deref())
            .bind(new_item.symlink_target.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.message().contains("UNIQUE") => Error::Conflict(
                    format!("item '{}' already exists in its directory", item.name),
                ),
                _ => Error::Database(e),
            })?;

            for segment in &new_item.segments {
                sqlx::query(
                    r#"
                    INSERT INTO segments (item_id, part_number, message_id, part_offset, part_size)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(item.id.to_string())
                .bind(segment.part_number as i64)
                .bind(&segment.message_id)
                .bind(segment.part_offset as i64)
                .bind(segment.part_size as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Create a directory when absent; returns the directory's id either way
    pub async fn ensure_dir(&self, parent_id: ItemId, name: &str) -> Result<ItemId> {
        if let Some(existing) = self.lookup(parent_id, name).await? {
            if existing.item_type != ItemType::Dir {
                return Err(Error::Conflict(format!(
                    "'{name}' exists and is not a directory"
                )));
            }
            return Ok(existing.id);
        }
        let id = ItemId::new();
        sqlx::query(
            r#"
            INSERT INTO items (id, parent_id, name, item_type, size, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(parent_id.to_string())
        .bind(name)
        .bind(ItemType::Dir.to_i32())
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Delete an item and every descendant
    pub async fn remove_tree(&self, id: ItemId) -> Result<()> {
        // ON DELETE CASCADE on parent_id clears descendants and segment rows
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteRange, FilePart, PartSegment};
    use chrono::Utc;

    fn file_item(parent: ItemId, name: &str, size: u64) -> VirtualItem {
        VirtualItem {
            id: ItemId::new(),
            parent_id: Some(parent),
            name: name.to_string(),
            item_type: ItemType::File,
            size,
            created_at: Utc::now(),
            release_date: None,
            last_health_check_at: None,
        }
    }

    #[tokio::test]
    async fn roots_exist_after_open() {
        let store = Store::open_in_memory().await.unwrap();
        let roots = store.roots();
        let content = store.item(roots.content).await.unwrap().unwrap();
        assert_eq!(content.name, "content");
        assert_eq!(content.item_type, ItemType::Dir);
        assert!(content.parent_id.is_none());
    }

    #[tokio::test]
    async fn lookup_and_children_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let roots = store.roots();
        let dir = store.ensure_dir(roots.content, "movies").await.unwrap();

        let mut item = file_item(dir, "b.mkv", 100);
        item.id = ItemId::new();
        let tree = JobTree {
            items: vec![
                NewItem::bare(file_item(dir, "a.mkv", 50)),
                NewItem::bare(item),
            ],
        };
        store.insert_job_tree(&tree).await.unwrap();

        let kids = store.children(dir).await.unwrap();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].name, "a.mkv", "children ordered by name");

        let found = store.lookup(dir, "b.mkv").await.unwrap().unwrap();
        assert_eq!(found.size, 100);
        assert!(store.lookup(dir, "c.mkv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_name_per_parent_is_a_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        let dir = store
            .ensure_dir(store.roots().content, "tv")
            .await
            .unwrap();
        let tree = JobTree {
            items: vec![NewItem::bare(file_item(dir, "x.mkv", 1))],
        };
        store.insert_job_tree(&tree).await.unwrap();

        let dup = JobTree {
            items: vec![NewItem::bare(file_item(dir, "x.mkv", 2))],
        };
        assert!(matches!(
            store.insert_job_tree(&dup).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn failed_tree_insert_stages_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let dir = store
            .ensure_dir(store.roots().content, "cat")
            .await
            .unwrap();
        store
            .insert_job_tree(&JobTree {
                items: vec![NewItem::bare(file_item(dir, "dup", 1))],
            })
            .await
            .unwrap();

        // Second tree: one fresh item then a duplicate that aborts the tx
        let tree = JobTree {
            items: vec![
                NewItem::bare(file_item(dir, "fresh", 1)),
                NewItem::bare(file_item(dir, "dup", 1)),
            ],
        };
        assert!(store.insert_job_tree(&tree).await.is_err());
        assert!(
            store.lookup(dir, "fresh").await.unwrap().is_none(),
            "rolled-back rows must not be visible"
        );
    }

    #[tokio::test]
    async fn segments_and_multipart_meta_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let dir = store
            .ensure_dir(store.roots().content, "m")
            .await
            .unwrap();

        let plain = file_item(dir, "plain.bin", 300);
        let plain_id = plain.id;
        let mut multi = file_item(dir, "entry.mkv", 200);
        multi.item_type = ItemType::MultipartFile;
        let multi_id = multi.id;

        let meta = MultipartMeta {
            aes: None,
            file_parts: vec![FilePart {
                segments: vec![PartSegment {
                    message_id: "s1@x".into(),
                    volume_offset: 0,
                    size: 300,
                }],
                segment_range: ByteRange::new(64, 264),
                part_range: ByteRange::new(0, 200),
            }],
        };

        let tree = JobTree {
            items: vec![
                NewItem {
                    item: plain,
                    segments: vec![
                        SegmentRef {
                            message_id: "a@x".into(),
                            part_number: 1,
                            part_offset: 0,
                            part_size: 150,
                        },
                        SegmentRef {
                            message_id: "b@x".into(),
                            part_number: 2,
                            part_offset: 150,
                            part_size: 150,
                        },
                    ],
                    multipart: None,
                    inline_data: None,
                    symlink_target: None,
                },
                NewItem {
                    item: multi,
                    segments: vec![],
                    multipart: Some(meta.clone()),
                    inline_data: None,
                    symlink_target: None,
                },
            ],
        };
        store.insert_job_tree(&tree).await.unwrap();

        let segments = store.segments(plain_id).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].message_id, "a@x");
        assert_eq!(segments[1].part_offset, 150);

        let loaded = store.multipart_meta(multi_id).await.unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(store.multipart_meta(plain_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_path_walks_to_root() {
        let store = Store::open_in_memory().await.unwrap();
        let movies = store
            .ensure_dir(store.roots().content, "movies")
            .await
            .unwrap();
        let job = store.ensure_dir(movies, "Movie").await.unwrap();
        let item = file_item(job, "movie.mkv", 1);
        let id = item.id;
        store
            .insert_job_tree(&JobTree {
                items: vec![NewItem::bare(item)],
            })
            .await
            .unwrap();

        let path = store.item_path(id).await.unwrap();
        assert_eq!(path, "content/movies/Movie/movie.mkv");
    }

    #[tokio::test]
    async fn remove_tree_cascades() {
        let store = Store::open_in_memory().await.unwrap();
        let dir = store
            .ensure_dir(store.roots().content, "gone")
            .await
            .unwrap();
        let item = file_item(dir, "f.bin", 1);
        let item_id = item.id;
        store
            .insert_job_tree(&JobTree {
                items: vec![NewItem {
                    item,
                    segments: vec![SegmentRef {
                        message_id: "m@x".into(),
                        part_number: 1,
                        part_offset: 0,
                        part_size: 1,
                    }],
                    multipart: None,
                    inline_data: None,
                    symlink_target: None,
                }],
            })
            .await
            .unwrap();

        store.remove_tree(dir).await.unwrap();
        assert!(store.item(dir).await.unwrap().is_none());
        assert!(store.item(item_id).await.unwrap().is_none());
        assert!(store.segments(item_id).await.unwrap().is_empty());
    }
}
