//! NZB job pipeline
//!
//! Transforms one queued NZB into virtual filesystem entries: first-segment
//! probe, PAR2 descriptor pass, classification, archive descriptor
//! extraction, optional article-existence sweep, and a single aggregation
//! transaction. Every step honors the job's cancellation token and the
//! pipeline connection budget.

mod aggregate;
mod classify;
mod par2;
mod rar;
mod sevenz;
mod volume;

pub(crate) use classify::{FileKind, classify, is_probably_obfuscated};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DuplicateNzbBehavior};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, PROGRESS_FINALIZING};
use crate::nntp::SegmentFetcher;
use crate::store::Store;
use crate::types::{
    AesParams, ByteRange, FilePart, ItemId, MultipartMeta, PartSegment, QueueItem, SegmentRef,
};

use volume::VolumeReader;

/// Shared collaborators handed to every job
#[derive(Clone)]
pub struct JobContext {
    /// Virtual item store
    pub store: Store,
    /// Segment fetch path
    pub fetcher: Arc<dyn SegmentFetcher>,
    /// Event bus for progress/status topics
    pub events: Arc<EventBus>,
    /// Service configuration
    pub config: Arc<Config>,
}

/// What a completed job produced
#[derive(Clone, Debug)]
pub struct JobOutcome {
    /// The job's mount folder
    pub download_dir_id: ItemId,
}

/// One NZB file after the first-segment probe
#[derive(Clone, Debug)]
struct ProbedFile {
    /// Name after yEnc/subject/PAR2 resolution
    name: String,
    /// Decoded size of the whole file
    total_size: u64,
    /// Ordered segment run with computed offsets
    segments: Vec<SegmentRef>,
    /// Poster-declared date
    date: Option<DateTime<Utc>>,
}

/// A file ready for aggregation
#[derive(Clone, Debug)]
pub(crate) struct PendingFile {
    pub name: String,
    pub size: u64,
    pub date: Option<DateTime<Utc>>,
    pub kind: PendingKind,
}

#[derive(Clone, Debug)]
pub(crate) enum PendingKind {
    /// Contiguous yEnc run (plain file)
    Segmented(Vec<SegmentRef>),
    /// Assembled from parts (archive entry, multipart join)
    Multipart(MultipartMeta),
}

/// Process one queued job end to end
pub async fn process_job(
    ctx: &JobContext,
    job: &QueueItem,
    cancel: &CancellationToken,
) -> Result<JobOutcome> {
    let nzb = nzb_rs::Nzb::parse(&job.nzb_contents)
        .map_err(|e| Error::InvalidNzb(format!("failed to parse NZB: {e}")))?;
    let password = nzb.meta.passwords.first().cloned();

    // Step 1: duplicate policy resolves the mount folder name up front
    let mount_name = resolve_mount_name(ctx, job).await?;

    // Step 2: the pipeline's connection budget
    let budget = ctx.config.queue.max_queue_connections.max(1);

    publish_status(ctx, job, "probing articles");
    let probed = probe_files(ctx, &nzb, job, budget, cancel).await?;

    // Step 3/4: PAR2 descriptor pass recovers names behind obfuscation
    publish_status(ctx, job, "reading par2 descriptors");
    let probed = apply_par2_names(ctx, probed, budget, cancel).await?;

    // Step 5/6: classification and per-group processing
    publish_status(ctx, job, "mapping archives");
    let pending = process_groups(ctx, probed, password.as_deref(), job, cancel).await?;

    // Step 7: optional full-health sweep over the important articles
    if ctx.config.health.ensure_article_existence {
        publish_status(ctx, job, "checking article availability");
        run_health_sweep(ctx, job, &pending, budget, cancel).await?;
    }

    // Step 8: aggregation in one store transaction
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    publish_status(ctx, job, "registering files");
    ctx.events.publish_debounced(Event::QueueProgress {
        id: job.id,
        percent: PROGRESS_FINALIZING,
    });
    let download_dir_id = aggregate::aggregate(
        ctx,
        aggregate::AggregateInput {
            mount_name,
            category: job.category.clone(),
            files: pending,
            health_checked: ctx.config.health.ensure_article_existence,
        },
    )
    .await?;

    Ok(JobOutcome { download_dir_id })
}

/// Apply the duplicate policy and pick the mount folder name
async fn resolve_mount_name(ctx: &JobContext, job: &QueueItem) -> Result<String> {
    let roots = ctx.store.roots();
    let Some(category_dir) = ctx.store.lookup(roots.content, &job.category).await? else {
        return Ok(job.job_name.clone());
    };
    let Some(existing) = ctx.store.lookup(category_dir.id, &job.job_name).await? else {
        return Ok(job.job_name.clone());
    };

    match ctx.config.queue.duplicate_nzb_behavior {
        DuplicateNzbBehavior::MarkFailed => Err(Error::Conflict(format!(
            "mount folder '{}/{}' already exists",
            job.category, job.job_name
        ))),
        DuplicateNzbBehavior::Overwrite => {
            tracing::info!(job = %job.job_name, "overwriting existing mount folder");
            ctx.store.remove_tree(existing.id).await?;
            Ok(job.job_name.clone())
        }
        DuplicateNzbBehavior::Increment => {
            for n in 2..=99u32 {
                let candidate = format!("{} ({n})", job.job_name);
                if ctx.store.lookup(category_dir.id, &candidate).await?.is_none() {
                    return Ok(candidate);
                }
            }
            Err(Error::Conflict(format!(
                "no free increment for mount folder '{}'",
                job.job_name
            )))
        }
    }
}

/// First-segment probe: fetch each file's leading yEnc header
async fn probe_files(
    ctx: &JobContext,
    nzb: &nzb_rs::Nzb,
    job: &QueueItem,
    budget: usize,
    cancel: &CancellationToken,
) -> Result<Vec<ProbedFile>> {
    let files: Vec<_> = nzb
        .files
        .iter()
        .filter(|f| !f.segments.is_empty())
        .collect();
    let total = files.len();
    if total == 0 {
        return Err(Error::InvalidNzb("NZB contains no segments".into()));
    }

    let mut probes = futures::stream::iter(files.iter().enumerate().map(
        |(index, file): (usize, &&nzb_rs::File)| {
        let fetcher = Arc::clone(&ctx.fetcher);
        async move {
            let mut segments: Vec<(u32, String)> = file
                .segments
                .iter()
                .map(|s| (s.number, s.message_id.clone()))
                .collect();
            segments.sort_by_key(|(number, _)| *number);
            let first_id = segments[0].1.clone();
            let header = fetcher.fetch_header(&first_id, cancel).await?;
            Ok::<_, Error>((index, segments, header))
        }
        .boxed()
    }))
    .buffer_unordered(budget);

    let mut out: Vec<Option<ProbedFile>> = vec![None; total];
    let mut completed = 0usize;
    while let Some(result) = probes.next().await {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (index, segments, header) = result?;
        let file = files[index];
        completed += 1;
        ctx.events.publish_debounced(Event::QueueProgress {
            id: job.id,
            percent: (completed * 40 / total) as u16,
        });

        let part_size = header.part_size;
        let total_size = header.total_size;
        if part_size == 0 || total_size == 0 {
            return Err(Error::Protocol(format!(
                "first segment of '{}' declares a zero size",
                file.subject
            )));
        }

        // Posters use a fixed article size; offsets follow from the first
        // header and the declared total
        let refs: Vec<SegmentRef> = segments
            .into_iter()
            .map(|(number, message_id)| {
                let offset = (number.saturating_sub(1)) as u64 * part_size;
                SegmentRef {
                    message_id,
                    part_number: number,
                    part_offset: offset,
                    part_size: part_size.min(total_size.saturating_sub(offset)),
                }
            })
            .collect();

        let name = if !header.file_name.is_empty() {
            crate::utils::sanitize_name(&header.file_name)
        } else {
            crate::utils::filename_from_subject(&file.subject)
                .map(|n| crate::utils::sanitize_name(&n))
                .unwrap_or_else(|| format!("file_{index}"))
        };

        out[index] = Some(ProbedFile {
            name,
            total_size,
            segments: refs,
            date: Some(file.posted_at),
        });
    }

    Ok(out.into_iter().flatten().collect())
}

/// Read PAR2 descriptors and override obfuscated names by size match
async fn apply_par2_names(
    ctx: &JobContext,
    mut probed: Vec<ProbedFile>,
    budget: usize,
    cancel: &CancellationToken,
) -> Result<Vec<ProbedFile>> {
    let par2_files: Vec<&ProbedFile> = probed
        .iter()
        .filter(|f| classify(&f.name) == FileKind::Par2)
        .collect();
    if par2_files.is_empty() {
        return Ok(probed);
    }

    let mut descriptors = Vec::new();
    for file in &par2_files {
        let mut reads = futures::stream::iter(file.segments.iter().map(|segment: &SegmentRef| {
            let fetcher = Arc::clone(&ctx.fetcher);
            async move {
                let mut stream = fetcher.fetch_segment(&segment.message_id, cancel).await?;
                let data = stream.read_to_end().await?;
                Ok::<_, Error>((segment.part_number, data))
            }
            .boxed()
        }))
        .buffer_unordered(budget);

        let mut parts = Vec::new();
        while let Some(result) = reads.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            parts.push(result?);
        }
        parts.sort_by_key(|(number, _)| *number);
        let bytes: Vec<u8> = parts.into_iter().flat_map(|(_, data)| data).collect();
        descriptors.extend(par2::parse_file_entries(&bytes));
    }

    // Size is the join key; ambiguous sizes stay untouched
    let mut by_size: BTreeMap<u64, Option<&par2::Par2FileEntry>> = BTreeMap::new();
    for entry in &descriptors {
        by_size
            .entry(entry.length)
            .and_modify(|slot| *slot = None)
            .or_insert(Some(entry));
    }

    for file in probed.iter_mut() {
        if classify(&file.name) == FileKind::Par2 {
            continue;
        }
        if !is_probably_obfuscated(&file.name) {
            continue;
        }
        if let Some(Some(entry)) = by_size.get(&file.total_size) {
            tracing::info!(
                obfuscated = %file.name,
                real = %entry.filename,
                "par2 descriptor resolved an obfuscated name"
            );
            file.name = crate::utils::sanitize_name(&entry.filename);
        }
    }

    Ok(probed)
}

/// Classify files and run the per-group processors
async fn process_groups(
    ctx: &JobContext,
    probed: Vec<ProbedFile>,
    password: Option<&str>,
    job: &QueueItem,
    cancel: &CancellationToken,
) -> Result<Vec<PendingFile>> {
    let mut rar_sets: BTreeMap<String, Vec<(u32, ProbedFile)>> = BTreeMap::new();
    let mut sevenz_sets: BTreeMap<String, Vec<(u32, ProbedFile)>> = BTreeMap::new();
    let mut mkv_sets: BTreeMap<String, Vec<(u32, ProbedFile)>> = BTreeMap::new();
    let mut pending = Vec::new();

    for file in probed {
        match classify(&file.name) {
            FileKind::Par2 => {} // consumed for metadata, never registered
            FileKind::Rar { set, volume } => {
                rar_sets.entry(set).or_default().push((volume, file));
            }
            FileKind::SevenZip { set, volume } => {
                sevenz_sets.entry(set).or_default().push((volume, file));
            }
            FileKind::MultipartMkv { set, volume } => {
                mkv_sets.entry(set).or_default().push((volume, file));
            }
            FileKind::Other => pending.push(PendingFile {
                size: file.total_size,
                date: file.date,
                kind: PendingKind::Segmented(file.segments.clone()),
                name: file.name,
            }),
        }
    }

    let total_sets = rar_sets.len() + sevenz_sets.len() + mkv_sets.len();
    let mut done_sets = 0usize;
    let bump = |done: usize| {
        if total_sets > 0 {
            (40 + done * 40 / total_sets) as u16
        } else {
            80
        }
    };

    for (set, mut volumes) in rar_sets {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        volumes.sort_by_key(|(v, _)| *v);
        pending.extend(process_rar_set(ctx, &set, &volumes, password, cancel).await?);
        done_sets += 1;
        ctx.events.publish_debounced(Event::QueueProgress {
            id: job.id,
            percent: bump(done_sets),
        });
    }

    for (set, mut volumes) in sevenz_sets {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        volumes.sort_by_key(|(v, _)| *v);
        pending.extend(process_sevenz_set(ctx, &set, &volumes, cancel).await?);
        done_sets += 1;
        ctx.events.publish_debounced(Event::QueueProgress {
            id: job.id,
            percent: bump(done_sets),
        });
    }

    for (set, mut volumes) in mkv_sets {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        volumes.sort_by_key(|(v, _)| *v);
        pending.push(process_mkv_set(&set, &volumes));
        done_sets += 1;
        ctx.events.publish_debounced(Event::QueueProgress {
            id: job.id,
            percent: bump(done_sets),
        });
    }

    Ok(pending)
}

/// Walk a RAR volume set and expose its store-method entries
async fn process_rar_set(
    ctx: &JobContext,
    set: &str,
    volumes: &[(u32, ProbedFile)],
    password: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Vec<PendingFile>> {
    struct EntryAccum {
        unpacked: u64,
        date: Option<DateTime<Utc>>,
        parts: Vec<FilePart>,
        written: u64,
        aes: Option<AesParams>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut entries: BTreeMap<String, EntryAccum> = BTreeMap::new();

    for (_, volume) in volumes {
        let mut reader = VolumeReader::new(&ctx.fetcher, cancel, &volume.segments);
        let scanned = rar::scan_volume(&mut reader).await.map_err(|e| match e {
            Error::Validation(msg) => Error::Validation(format!("rar set '{set}': {msg}")),
            other => other,
        })?;

        for entry in scanned {
            if entry.is_dir {
                continue;
            }
            if !entry.is_store {
                return Err(Error::Validation(format!(
                    "rar set '{set}' entry '{}' is compressed and cannot be mapped",
                    entry.name
                )));
            }

            let aes = match &entry.encryption {
                Some(enc) => {
                    let Some(password) = password else {
                        return Err(Error::Validation(format!(
                            "rar set '{set}' is encrypted and no password was supplied"
                        )));
                    };
                    Some(AesParams {
                        key: rar::derive_key(password, &enc.salt, enc.kdf_count).to_vec(),
                        iv: enc.iv.to_vec(),
                    })
                }
                None => None,
            };

            let name = entry
                .name
                .rsplit('/')
                .next()
                .unwrap_or(&entry.name)
                .to_string();
            let accum = entries.entry(name.clone()).or_insert_with(|| {
                order.push(name.clone());
                EntryAccum {
                    unpacked: entry.unpacked_size,
                    date: volume.date,
                    parts: Vec::new(),
                    written: 0,
                    aes: None,
                }
            });
            if accum.aes.is_none() {
                accum.aes = aes;
            }

            let len = entry.data_range.len();
            accum.parts.push(FilePart {
                segments: part_segments(&volume.segments, entry.data_range),
                segment_range: entry.data_range,
                part_range: ByteRange::new(accum.written, accum.written + len),
            });
            accum.written += len;
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|name| {
            entries.remove(&name).map(|accum| PendingFile {
                size: accum.unpacked,
                date: accum.date,
                kind: PendingKind::Multipart(MultipartMeta {
                    aes: accum.aes,
                    file_parts: accum.parts,
                }),
                name,
            })
        })
        .collect())
}

/// Parse a 7z set (split volumes are raw byte concatenation)
async fn process_sevenz_set(
    ctx: &JobContext,
    set: &str,
    volumes: &[(u32, ProbedFile)],
    cancel: &CancellationToken,
) -> Result<Vec<PendingFile>> {
    // Build one global segment run across the volumes
    let mut global: Vec<SegmentRef> = Vec::new();
    let mut base = 0u64;
    let date = volumes.first().and_then(|(_, f)| f.date);
    for (_, volume) in volumes {
        for segment in &volume.segments {
            global.push(SegmentRef {
                message_id: segment.message_id.clone(),
                part_number: segment.part_number,
                part_offset: base + segment.part_offset,
                part_size: segment.part_size,
            });
        }
        base += volume.total_size;
    }

    let mut reader = VolumeReader::new(&ctx.fetcher, cancel, &global);
    let scanned = sevenz::scan_archive(&mut reader).await.map_err(|e| match e {
        Error::Validation(msg) => Error::Validation(format!("7z set '{set}': {msg}")),
        other => other,
    })?;

    Ok(scanned
        .into_iter()
        .map(|entry| {
            let name = entry
                .name
                .rsplit('/')
                .next()
                .unwrap_or(&entry.name)
                .to_string();
            PendingFile {
                size: entry.size,
                date,
                kind: PendingKind::Multipart(MultipartMeta {
                    aes: None,
                    file_parts: vec![FilePart {
                        segments: part_segments(&global, entry.data_range),
                        segment_range: entry.data_range,
                        part_range: ByteRange::new(0, entry.size),
                    }],
                }),
                name,
            }
        })
        .collect())
}

/// Join `.mkv.001..N` volumes into one virtual file
fn process_mkv_set(set: &str, volumes: &[(u32, ProbedFile)]) -> PendingFile {
    let mut parts = Vec::new();
    let mut written = 0u64;
    for (_, volume) in volumes {
        let len = volume.total_size;
        parts.push(FilePart {
            segments: volume
                .segments
                .iter()
                .map(|s| PartSegment {
                    message_id: s.message_id.clone(),
                    volume_offset: s.part_offset,
                    size: s.part_size,
                })
                .collect(),
            segment_range: ByteRange::new(0, len),
            part_range: ByteRange::new(written, written + len),
        });
        written += len;
    }
    PendingFile {
        name: set.to_string(),
        size: written,
        date: volumes.first().and_then(|(_, f)| f.date),
        kind: PendingKind::Multipart(MultipartMeta {
            aes: None,
            file_parts: parts,
        }),
    }
}

/// Sweep the important articles; a confirmed missing article defers the job
///
/// Importance is decided by the resolved name: only files that classify as
/// playable video are swept. Samples, nfo files, and other companions may
/// rot without failing the job.
async fn run_health_sweep(
    ctx: &JobContext,
    job: &QueueItem,
    pending: &[PendingFile],
    budget: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut ids: Vec<String> = Vec::new();
    for file in pending.iter().filter(|f| crate::utils::is_video(&f.name)) {
        match &file.kind {
            PendingKind::Segmented(segments) => {
                ids.extend(segments.iter().map(|s| s.message_id.clone()));
            }
            PendingKind::Multipart(meta) => {
                for part in &meta.file_parts {
                    ids.extend(part.segments.iter().map(|s| s.message_id.clone()));
                }
            }
        }
    }
    ids.sort();
    ids.dedup();

    let events = Arc::clone(&ctx.events);
    let job_id = job.id;
    let progress = move |fraction: f64| {
        events.publish_debounced(Event::HealthProgress {
            id: job_id,
            fraction,
        });
    };

    let report = ctx
        .fetcher
        .check_all_segments(
            &ids,
            budget,
            ctx.config.health.health_check_sampling_rate,
            ctx.config.health.min_health_check_segments,
            &progress,
            cancel,
        )
        .await?;

    if let Some(missing) = report.missing.first() {
        ctx.events.publish(Event::HealthStatus {
            status: format!("article <{missing}> is missing on all servers"),
        });
        // A server may come back; escalate to a retryable deferral
        return Err(Error::Transient(format!(
            "important article <{missing}> missing on all servers"
        )));
    }

    ctx.events.publish(Event::HealthStatus {
        status: format!("{} of {} articles verified", report.confirmed, report.sampled),
    });
    Ok(())
}

/// Segments of a volume overlapping a data range, as part segments
fn part_segments(segments: &[SegmentRef], range: ByteRange) -> Vec<PartSegment> {
    segments
        .iter()
        .filter(|s| s.part_offset < range.end && s.part_offset + s.part_size > range.start)
        .map(|s| PartSegment {
            message_id: s.message_id.clone(),
            volume_offset: s.part_offset,
            size: s.part_size,
        })
        .collect()
}

fn publish_status(ctx: &JobContext, job: &QueueItem, status: &str) {
    ctx.events.publish(Event::QueueStatus {
        id: job.id,
        status: status.to_string(),
    });
}
