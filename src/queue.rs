//! Queue manager
//!
//! A single in-flight worker drains the store-backed job queue: poll the
//! eligible top item, run the pipeline under a linked cancellation token,
//! finalize, repeat. Removal of an in-flight job cancels its processor and
//! waits for it to unwind before the rows disappear. The state mutex guards
//! transitions only; pipeline work never runs under it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, IsRetryable, Result};
use crate::events::{Event, Topic};
use crate::pipeline::{self, JobContext};
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{HistoryItem, JobId, JobStatus, QueueItem};

struct ActiveJob {
    id: JobId,
    cancel: CancellationToken,
    done: tokio::sync::watch::Receiver<bool>,
}

/// Serializes job execution over the persisted queue
pub struct QueueManager {
    ctx: JobContext,
    shutdown: CancellationToken,
    active: Arc<tokio::sync::Mutex<Option<ActiveJob>>>,
    in_progress: Arc<std::sync::Mutex<Option<(QueueItem, u16)>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
}

impl QueueManager {
    /// Create a manager over the shared job context
    pub fn new(ctx: JobContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            shutdown: CancellationToken::new(),
            active: Arc::new(tokio::sync::Mutex::new(None)),
            in_progress: Arc::new(std::sync::Mutex::new(None)),
            worker: std::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the worker loop (idempotent)
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.worker_loop().await;
        });
        *self.lock_worker() = Some(handle);

        // Mirror progress events into the in-progress snapshot
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut sub = manager.ctx.events.subscribe(Topic::QueueProgress);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    received = sub.recv() => match received {
                        Ok(Event::QueueProgress { id, percent }) => {
                            let mut slot = manager.lock_in_progress();
                            if let Some((item, current)) = slot.as_mut()
                                && item.id == id
                            {
                                *current = percent;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Cancel the worker and wait for the in-flight job to unwind
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    /// The job currently being processed and its progress percent
    pub fn in_progress(&self) -> Option<(QueueItem, u16)> {
        self.lock_in_progress().clone()
    }

    /// Remove jobs from the queue
    ///
    /// When one of them is in flight its processor is cancelled and awaited
    /// first, so staged writes are discarded before the rows go away.
    pub async fn remove_items(&self, ids: &[JobId]) -> Result<u64> {
        let waiter = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(job) if ids.contains(&job.id) => {
                    job.cancel.cancel();
                    Some(job.done.clone())
                }
                _ => None,
            }
        };
        if let Some(mut done) = waiter {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }

        let removed = self.ctx.store.remove_queue_items(ids).await?;
        for id in ids {
            self.ctx.events.publish(Event::QueueRemoved { id: *id });
        }
        Ok(removed)
    }

    async fn worker_loop(&self) {
        let poll_retry = RetryPolicy::default();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = with_retry(&poll_retry, || self.ctx.store.next_eligible()).await;
            match next {
                Ok(Some(item)) => self.run_one(item).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.queue.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "queue poll failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.queue.poll_interval) => {}
                    }
                }
            }
        }
        tracing::info!("queue worker stopped");
    }

    async fn run_one(&self, item: QueueItem) {
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        {
            let mut active = self.active.lock().await;
            *active = Some(ActiveJob {
                id: item.id,
                cancel: cancel.clone(),
                done: done_rx,
            });
        }
        *self.lock_in_progress() = Some((item.clone(), 0));
        self.ctx.events.publish(Event::QueueProgress {
            id: item.id,
            percent: 0,
        });

        let started = std::time::Instant::now();
        tracing::info!(job = %item.job_name, id = %item.id, "job started");
        let result = pipeline::process_job(&self.ctx, &item, &cancel).await;
        let elapsed = started.elapsed().as_secs();

        match result {
            Ok(outcome) => {
                let history = HistoryItem {
                    id: item.id,
                    job_name: item.job_name.clone(),
                    category: item.category.clone(),
                    status: JobStatus::Completed,
                    total_segment_bytes: item.total_segment_bytes,
                    download_time_seconds: elapsed,
                    fail_message: None,
                    download_dir_id: Some(outcome.download_dir_id),
                    created_at: Utc::now(),
                };
                match self.ctx.store.finalize_job(&history).await {
                    Ok(()) => {
                        tracing::info!(job = %item.job_name, "job completed");
                        self.ctx.events.publish(Event::QueueProgress {
                            id: item.id,
                            percent: 100,
                        });
                        self.ctx.events.publish(Event::QueueRemoved { id: item.id });
                        self.ctx.events.publish(Event::HistoryAdded {
                            item: Box::new(history),
                        });
                    }
                    Err(e) => {
                        tracing::error!(job = %item.job_name, error = %e, "finalize failed");
                    }
                }
            }
            Err(Error::Cancelled) => {
                // The QueueItem stays; staged store writes rolled back with
                // the aborted transaction
                tracing::info!(job = %item.job_name, "job cancelled");
                self.ctx.events.publish(Event::QueueStatus {
                    id: item.id,
                    status: "cancelled".into(),
                });
            }
            Err(e) if e.is_retryable() => {
                let until = Utc::now()
                    + chrono::Duration::from_std(self.ctx.config.queue.defer_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                tracing::warn!(job = %item.job_name, error = %e, "job deferred");
                if let Err(defer_err) = self.ctx.store.defer_queue_item(item.id, until).await {
                    tracing::error!(error = %defer_err, "deferral failed");
                }
                self.ctx.events.publish(Event::QueueStatus {
                    id: item.id,
                    status: format!("deferred: {}", e.fail_message()),
                });
            }
            Err(e) => {
                let history = HistoryItem {
                    id: item.id,
                    job_name: item.job_name.clone(),
                    category: item.category.clone(),
                    status: JobStatus::Failed,
                    total_segment_bytes: item.total_segment_bytes,
                    download_time_seconds: elapsed,
                    fail_message: Some(e.fail_message()),
                    download_dir_id: None,
                    created_at: Utc::now(),
                };
                tracing::warn!(job = %item.job_name, error = %e, "job failed");
                match self.ctx.store.finalize_job(&history).await {
                    Ok(()) => {
                        self.ctx.events.publish(Event::QueueRemoved { id: item.id });
                        self.ctx.events.publish(Event::HistoryAdded {
                            item: Box::new(history),
                        });
                    }
                    Err(store_err) => {
                        tracing::error!(error = %store_err, "failed-job finalize failed");
                    }
                }
            }
        }

        {
            let mut active = self.active.lock().await;
            *active = None;
        }
        *self.lock_in_progress() = None;
        done_tx.send(true).ok();
    }

    fn lock_in_progress(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<(QueueItem, u16)>> {
        self.in_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}
