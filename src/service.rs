//! Service facade
//!
//! `UsenetFs` wires the store, the multi-server client, the event bus, the
//! reader, and the queue manager together, and exposes the surfaces the
//! WebDAV and download-manager adapters consume. Cloneable; all fields are
//! Arc-backed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ServerConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Subscription, Topic};
use crate::nntp::{CircuitState, MultiServerClient, NntpConnection, SegmentFetcher};
use crate::pipeline::JobContext;
use crate::queue::QueueManager;
use crate::reader::VirtualFileReader;
use crate::store::Store;
use crate::types::{
    HistoryItem, ItemId, JobId, JobStatus, PostProcessing, Priority, QueueItem, ServerHealth,
    VirtualItem,
};
use crate::utils;

/// The Usenet-backed virtual filesystem service
#[derive(Clone)]
pub struct UsenetFs {
    config: Arc<Config>,
    store: Store,
    client: Arc<MultiServerClient>,
    events: Arc<EventBus>,
    reader: VirtualFileReader,
    queue: Arc<QueueManager>,
    accepting_new: Arc<AtomicBool>,
}

impl UsenetFs {
    /// Validate the configuration, open the store, and wire the components
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Store::open(&config.persistence.database_path).await?;
        let events = EventBus::new();
        let client = Arc::new(
            MultiServerClient::new(&config.servers, &config.client)
                .with_events(Arc::clone(&events)),
        );
        let fetcher: Arc<dyn SegmentFetcher> = client.clone();
        let reader = VirtualFileReader::new(store.clone(), Arc::clone(&fetcher));

        let queue = QueueManager::new(JobContext {
            store: store.clone(),
            fetcher,
            events: Arc::clone(&events),
            config: Arc::clone(&config),
        });

        tracing::info!(
            servers = config.servers.len(),
            database = %config.persistence.database_path.display(),
            "usenet-fs initialized"
        );

        Ok(Self {
            config,
            store,
            client,
            events,
            reader,
            queue,
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Start the queue worker
    pub fn start(&self) {
        self.queue.start();
    }

    /// Stop accepting jobs, cancel the worker, and wait for it to unwind
    pub async fn shutdown(&self) {
        self.accepting_new.store(false, Ordering::SeqCst);
        self.queue.shutdown().await;
    }

    // ----- job ingress -----

    /// Parse and enqueue an NZB; returns the new job's id
    pub async fn enqueue(
        &self,
        nzb_bytes: &[u8],
        filename: &str,
        category: &str,
        priority: Priority,
        post_processing: PostProcessing,
    ) -> Result<JobId> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let contents = std::str::from_utf8(nzb_bytes)
            .map_err(|e| Error::InvalidNzb(format!("NZB is not valid UTF-8: {e}")))?;
        let nzb = nzb_rs::Nzb::parse(contents)
            .map_err(|e| Error::InvalidNzb(format!("failed to parse NZB: {e}")))?;
        if nzb.files.iter().all(|f| f.segments.is_empty()) {
            return Err(Error::InvalidNzb("NZB contains no segments".into()));
        }

        let total_segment_bytes: u64 = nzb
            .files
            .iter()
            .flat_map(|f| f.segments.iter())
            .map(|s| s.size as u64)
            .sum();

        let job_name = nzb
            .meta
            .title
            .clone()
            .unwrap_or_else(|| filename.strip_suffix(".nzb").unwrap_or(filename).to_string());
        let job_name = utils::sanitize_name(&job_name);

        let item = QueueItem {
            id: JobId::new(),
            file_name: filename.to_string(),
            job_name,
            category: utils::sanitize_name(category),
            nzb_contents: contents.to_string(),
            priority,
            pause_until: None,
            total_segment_bytes,
            post_processing,
            created_at: Utc::now(),
        };
        self.store.insert_queue_item(&item).await?;

        tracing::info!(
            id = %item.id,
            job = %item.job_name,
            bytes = item.total_segment_bytes,
            "job enqueued"
        );
        self.events.publish(Event::QueueAdded {
            item: Box::new(item.clone()),
        });
        Ok(item.id)
    }

    /// Remove queued jobs, cancelling the in-flight one when included
    pub async fn remove_queue_items(&self, ids: &[JobId]) -> Result<u64> {
        self.queue.remove_items(ids).await
    }

    /// Queue listing in dispatch order
    pub async fn list_queue(&self) -> Result<Vec<QueueItem>> {
        self.store.list_queue().await
    }

    /// History listing, newest first
    ///
    /// The window is capped at the configured SAB-compatible limit unless
    /// `ignore_sab_history_limit` is set.
    pub async fn list_history(
        &self,
        status_filter: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryItem>> {
        let limit = if self.config.persistence.ignore_sab_history_limit {
            limit
        } else {
            limit.min(self.config.persistence.history_limit)
        };
        self.store.list_history(status_filter, offset, limit).await
    }

    /// The job currently being processed and its progress percent
    pub fn get_in_progress(&self) -> Option<(QueueItem, u16)> {
        self.queue.in_progress()
    }

    // ----- read path (WebDAV adapter surface) -----

    /// Find a child item by name
    pub async fn lookup(&self, parent_id: ItemId, name: &str) -> Result<Option<VirtualItem>> {
        self.store.lookup(parent_id, name).await
    }

    /// List a directory
    pub async fn children(&self, parent_id: ItemId) -> Result<Vec<VirtualItem>> {
        self.store.children(parent_id).await
    }

    /// Fetch an item by id
    pub async fn item(&self, id: ItemId) -> Result<Option<VirtualItem>> {
        self.store.item(id).await
    }

    /// Virtual path of an item
    pub async fn item_path(&self, id: ItemId) -> Result<String> {
        self.store.item_path(id).await
    }

    /// Well-known root folder ids
    pub fn roots(&self) -> crate::store::Roots {
        self.store.roots()
    }

    /// Read a byte range out of a virtual file
    pub async fn read_range(
        &self,
        id: ItemId,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.reader.read_range(id, offset, length, cancel).await
    }

    // ----- download keys -----

    /// Compute the download key for a virtual path
    pub fn download_key(&self, path: &str) -> String {
        utils::download_key(path, &self.config.security)
    }

    /// Verify a presented download key; mismatch is `Unauthorized`
    pub fn verify_download_key(&self, path: &str, presented: &str) -> Result<()> {
        if utils::verify_download_key(path, presented, &self.config.security) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "download key rejected for '{path}'"
            )))
        }
    }

    // ----- server surface -----

    /// Snapshot of every server's configuration
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.client.server_configs()
    }

    /// Snapshot of every server's health record
    pub fn server_health_stats(&self) -> Vec<ServerHealth> {
        self.client.health_stats()
    }

    /// Circuit state per server id
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.client.circuit_states()
    }

    /// Connect and authenticate against one configured server, reporting
    /// the round-trip latency
    pub async fn test_server(&self, server_id: &str) -> Result<std::time::Duration> {
        let server = self
            .config
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| Error::NotFound(format!("server '{server_id}'")))?;
        let started = std::time::Instant::now();
        let mut conn = NntpConnection::connect(server, &self.config.client).await?;
        let latency = started.elapsed();
        conn.quit().await;
        Ok(latency)
    }

    // ----- events -----

    /// Subscribe to one topic; state topics replay their last message
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.events.subscribe(topic)
    }

    /// The bus itself, for adapters that fan out to many subscribers
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }
}
