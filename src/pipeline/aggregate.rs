//! Aggregation: turn pending files into one atomically inserted job tree

use std::collections::HashSet;

use chrono::Utc;

use crate::config::ImportStrategy;
use crate::error::{Error, Result};
use crate::store::{JobTree, NewItem};
use crate::types::{ItemId, ItemType, VirtualItem};
use crate::utils;

use super::{JobContext, PendingFile, PendingKind, is_probably_obfuscated};

pub(crate) struct AggregateInput {
    pub mount_name: String,
    pub category: String,
    pub files: Vec<PendingFile>,
    pub health_checked: bool,
}

/// Build and insert the job's tree; returns the mount folder id
pub(crate) async fn aggregate(ctx: &JobContext, input: AggregateInput) -> Result<ItemId> {
    let blacklist = &ctx.config.import.blacklisted_extensions;
    let mut files: Vec<PendingFile> = input
        .files
        .into_iter()
        .filter(|f| {
            let dropped = utils::extension(&f.name)
                .is_some_and(|ext| blacklist.iter().any(|b| b.eq_ignore_ascii_case(&ext)));
            if dropped {
                tracing::debug!(name = %f.name, "dropping blacklisted extension");
            }
            !dropped
        })
        .collect();

    if files.is_empty() {
        return Err(Error::Validation(
            "job produced no registrable files".into(),
        ));
    }

    // A lone obfuscated file takes the mount folder's name
    if files.len() == 1 && is_probably_obfuscated(&files[0].name) {
        let ext = utils::extension(&files[0].name);
        files[0].name = match ext {
            Some(ext) => format!("{}.{ext}", input.mount_name),
            None => input.mount_name.clone(),
        };
    }

    // Unique names within the mount folder
    let mut seen: HashSet<String> = HashSet::new();
    for file in files.iter_mut() {
        if seen.insert(file.name.clone()) {
            continue;
        }
        for n in 2..=99u32 {
            let candidate = utils::numbered_name(&file.name, n);
            if seen.insert(candidate.clone()) {
                file.name = candidate;
                break;
            }
        }
    }

    if ctx.config.import.ensure_importable_video && !files.iter().any(|f| utils::is_video(&f.name))
    {
        return Err(Error::Validation(
            "no importable video file in this job".into(),
        ));
    }

    let now = Utc::now();
    let health_stamp = input.health_checked.then_some(now);
    let roots = ctx.store.roots();
    let category_dir = ctx.store.ensure_dir(roots.content, &input.category).await?;

    let job_dir = VirtualItem {
        id: ItemId::new(),
        parent_id: Some(category_dir),
        name: input.mount_name.clone(),
        item_type: ItemType::Dir,
        size: 0,
        created_at: now,
        release_date: files.iter().find_map(|f| f.date),
        last_health_check_at: None,
    };
    let job_dir_id = job_dir.id;

    let mut tree = JobTree {
        items: vec![NewItem::bare(job_dir)],
    };

    let mut video_paths: Vec<(String, String)> = Vec::new();
    for file in &files {
        let item = VirtualItem {
            id: ItemId::new(),
            parent_id: Some(job_dir_id),
            name: file.name.clone(),
            item_type: match &file.kind {
                PendingKind::Segmented(_) => ItemType::File,
                PendingKind::Multipart(_) => ItemType::MultipartFile,
            },
            size: file.size,
            created_at: now,
            release_date: file.date,
            last_health_check_at: health_stamp,
        };
        if utils::is_video(&file.name) {
            let path = format!(
                "{}/{}/{}/{}",
                utils::CONTENT_ROOT,
                input.category,
                input.mount_name,
                file.name
            );
            video_paths.push((file.name.clone(), path));
        }
        tree.items.push(match &file.kind {
            PendingKind::Segmented(segments) => NewItem {
                item,
                segments: segments.clone(),
                multipart: None,
                inline_data: None,
                symlink_target: None,
            },
            PendingKind::Multipart(meta) => NewItem {
                item,
                segments: Vec::new(),
                multipart: Some(meta.clone()),
                inline_data: None,
                symlink_target: None,
            },
        });
    }

    match ctx.config.import.import_strategy {
        ImportStrategy::Strm => {
            for (name, path) in &video_paths {
                let key = utils::download_key(path, &ctx.config.security);
                let url = match ctx.config.import.strm_base_url.as_deref() {
                    Some(base) => format!("{}/{path}?key={key}", base.trim_end_matches('/')),
                    None => format!("/{path}?key={key}"),
                };
                let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                let data = url.into_bytes();
                tree.items.push(NewItem {
                    item: VirtualItem {
                        id: ItemId::new(),
                        parent_id: Some(job_dir_id),
                        name: format!("{stem}.strm"),
                        item_type: ItemType::File,
                        size: data.len() as u64,
                        created_at: now,
                        release_date: None,
                        last_health_check_at: None,
                    },
                    segments: Vec::new(),
                    multipart: None,
                    inline_data: Some(data),
                    symlink_target: None,
                });
            }
        }
        ImportStrategy::Symlinks => {
            if !video_paths.is_empty() {
                let symlink_category = ctx
                    .store
                    .ensure_dir(roots.symlinks, &input.category)
                    .await?;
                let symlink_dir = VirtualItem {
                    id: ItemId::new(),
                    parent_id: Some(symlink_category),
                    name: input.mount_name.clone(),
                    item_type: ItemType::Dir,
                    size: 0,
                    created_at: now,
                    release_date: None,
                    last_health_check_at: None,
                };
                let symlink_dir_id = symlink_dir.id;
                tree.items.push(NewItem::bare(symlink_dir));
                for (name, path) in &video_paths {
                    tree.items.push(NewItem {
                        item: VirtualItem {
                            id: ItemId::new(),
                            parent_id: Some(symlink_dir_id),
                            name: name.clone(),
                            item_type: ItemType::Symlink,
                            size: 0,
                            created_at: now,
                            release_date: None,
                            last_health_check_at: None,
                        },
                        segments: Vec::new(),
                        multipart: None,
                        inline_data: None,
                        symlink_target: Some(path.clone()),
                    });
                }
            }
        }
    }

    ctx.store.insert_job_tree(&tree).await?;
    tracing::info!(
        mount = %input.mount_name,
        category = %input.category,
        files = files.len(),
        "job tree registered"
    );
    Ok(job_dir_id)
}
