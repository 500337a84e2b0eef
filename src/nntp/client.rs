//! Multi-server client: routes segment requests across server pools by
//! priority with failover, circuit breaking, and a missing-segment cache.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::events::{ConnectionActivity, Event, EventBus};
use crate::types::{ServerHealth, YencHeader};

use super::cache::TtlLru;
use super::circuit::{CircuitBreaker, CircuitState};
use super::pool::ServerPool;
use super::stream::SegmentStream;

/// Seam between the fetch path and its consumers (reader, pipeline)
///
/// The production implementation is [`MultiServerClient`]; tests substitute
/// scripted fetchers.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Fetch a segment as `(header, body stream)`
    async fn fetch_segment(
        &self,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SegmentStream>;

    /// Fetch only the yEnc header of a segment
    async fn fetch_header(&self, message_id: &str, cancel: &CancellationToken)
    -> Result<YencHeader>;

    /// Check whether at least one server holds the article
    async fn stat(&self, message_id: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Probe a sample of `message_ids` for existence with bounded concurrency
    ///
    /// Samples `max(min_samples, ceil(rate * N))` ids uniformly (all of them
    /// when N is smaller), reports fractional progress, and ends the sweep at
    /// the first confirmed-missing article so the enclosing job can fail
    /// fast.
    async fn check_all_segments(
        &self,
        message_ids: &[String],
        concurrency: usize,
        sampling_rate: f64,
        min_samples: usize,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<SegmentCheckReport> {
        check_all_segments_impl(
            self,
            message_ids,
            concurrency,
            sampling_rate,
            min_samples,
            progress,
            cancel,
        )
        .await
    }
}

/// Non-generic-`Self` body for [`SegmentFetcher::check_all_segments`]; kept
/// as a free function over `&dyn SegmentFetcher` so the iterator/async-block
/// closures below don't trip rustc's HRTB inference on a generic default
/// trait method.
async fn check_all_segments_impl<F: SegmentFetcher + ?Sized>(
    fetcher: &F,
    message_ids: &[String],
    concurrency: usize,
    sampling_rate: f64,
    min_samples: usize,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<SegmentCheckReport> {
    let total = message_ids.len();
    if total == 0 {
        progress(1.0);
        return Ok(SegmentCheckReport {
            sampled: 0,
            confirmed: 0,
            missing: Vec::new(),
        });
    }

    let target = ((sampling_rate * total as f64).ceil() as usize)
        .max(min_samples)
        .min(total);

    let sampled: Vec<&String> = if target == total {
        message_ids.iter().collect()
    } else {
        rand::seq::index::sample(&mut rand::thread_rng(), total, target)
            .into_iter()
            .map(|i| &message_ids[i])
            .collect()
    };

    let mut futs = Vec::with_capacity(sampled.len());
    for id in &sampled {
        let id = (*id).clone();
        futs.push(async move {
            let exists = fetcher.stat(&id, cancel).await;
            (id, exists)
        });
    }
    let mut checks = futures::stream::iter(futs).buffer_unordered(concurrency.max(1));

    let mut confirmed = 0usize;
    let mut missing = Vec::new();
    let mut completed = 0usize;
    while let Some((id, result)) = checks.next().await {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        completed += 1;
        progress(completed as f64 / target as f64);
        match result {
            Ok(true) => confirmed += 1,
            Ok(false) => {
                tracing::warn!(message_id = %id, "article confirmed missing during health sweep");
                missing.push(id);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    progress(1.0);

    Ok(SegmentCheckReport {
        sampled: target,
        confirmed,
        missing,
    })
}

/// Outcome of a [`check_all_segments`](SegmentFetcher::check_all_segments) sweep
#[derive(Clone, Debug)]
pub struct SegmentCheckReport {
    /// Number of articles selected for the sweep
    pub sampled: usize,
    /// Number of articles confirmed present before the sweep ended
    pub confirmed: usize,
    /// Articles confirmed missing on every consulted server
    pub missing: Vec<String>,
}

struct ServerEntry {
    pool: Arc<ServerPool>,
    breaker: CircuitBreaker,
}

/// Routes one segment request across the per-server pools
pub struct MultiServerClient {
    entries: Vec<ServerEntry>,
    missing: Mutex<TtlLru<String, ()>>,
    headers: Mutex<TtlLru<String, YencHeader>>,
    events: Option<Arc<EventBus>>,
    last_activity: Mutex<ConnectionActivity>,
}

enum FetchOp {
    Stream,
    Header,
    Stat,
}

enum FetchOutcome {
    Stream(SegmentStream),
    Header(YencHeader),
    Present,
}

impl MultiServerClient {
    /// Build pools and breakers for every configured server
    pub fn new(servers: &[ServerConfig], client_config: &ClientConfig) -> Self {
        let entries = servers
            .iter()
            .filter(|s| s.enabled)
            .map(|server| ServerEntry {
                pool: ServerPool::new(server.clone(), client_config.clone()),
                breaker: CircuitBreaker::new(
                    client_config.circuit_open_threshold,
                    client_config.circuit_cooldown,
                ),
            })
            .collect();
        Self {
            entries,
            missing: Mutex::new(TtlLru::new(
                client_config.missing_cache_capacity,
                client_config.missing_cache_ttl,
            )),
            headers: Mutex::new(TtlLru::new(
                client_config.header_cache_capacity,
                // Headers never change for a message-id; a long TTL just
                // bounds memory alongside the capacity cap
                std::time::Duration::from_secs(24 * 3600),
            )),
            events: None,
            last_activity: Mutex::new(ConnectionActivity::Idle),
        }
    }

    /// Attach an event bus for connection-activity state events
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Snapshot of every server's configuration
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.entries.iter().map(|e| e.pool.config().clone()).collect()
    }

    /// Snapshot of every server's health record
    pub fn health_stats(&self) -> Vec<ServerHealth> {
        self.entries.iter().map(|e| e.pool.snapshot()).collect()
    }

    /// Circuit state per server id (stats surface and tests)
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.entries
            .iter()
            .map(|e| (e.pool.config().id.clone(), e.breaker.state()))
            .collect()
    }

    /// Routing policy for a single segment request: consult the missing
    /// cache, order candidates by priority then health bias, retry once on
    /// the same server, cache an all-NotFound result, and report all-errored
    /// as transient
    async fn route(
        &self,
        message_id: &str,
        op: FetchOp,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        if self.is_cached_missing(message_id) {
            return Err(Error::NotFound(format!(
                "article <{message_id}> (cached missing)"
            )));
        }

        let mut candidates: Vec<&ServerEntry> = self
            .entries
            .iter()
            .filter(|e| e.pool.snapshot().available)
            .collect();
        if candidates.is_empty() {
            return Err(Error::Transient("no servers available".into()));
        }
        candidates.sort_by_key(|e| {
            (
                e.pool.config().priority,
                e.pool.snapshot().consecutive_failures,
            )
        });

        let admitted: Vec<&ServerEntry> = candidates
            .iter()
            .copied()
            .filter(|e| e.breaker.try_acquire())
            .collect();
        // Every circuit open: last-resort probe straight through them
        let probing_open_circuits = admitted.is_empty();
        let list = if probing_open_circuits {
            tracing::debug!(message_id, "all circuits open, last-resort probe");
            candidates
        } else {
            admitted
        };

        let mut attempted = 0usize;
        let mut not_found = 0usize;
        let mut last_error: Option<Error> = None;

        for entry in list {
            attempted += 1;
            let server_id = entry.pool.config().id.clone();
            let mut tries = 0;
            loop {
                tries += 1;
                match self.attempt(entry, message_id, &op, cancel).await {
                    Ok(outcome) => {
                        entry.pool.record_success();
                        entry.breaker.on_success();
                        self.publish_activity();
                        return Ok(outcome);
                    }
                    Err(Error::NotFound(_)) => {
                        entry.pool.record_not_found();
                        entry.breaker.on_success();
                        not_found += 1;
                        break;
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e @ (Error::Unauthorized(_) | Error::Fatal(_))) => {
                        entry.pool.record_failure(&e);
                        tracing::error!(server = %server_id, error = %e, "server failed hard");
                        if let Some(events) = &self.events {
                            events.publish(Event::HealthStatus {
                                status: format!("server '{server_id}' disabled: {e}"),
                            });
                        }
                        last_error = Some(e);
                        break;
                    }
                    Err(e) => {
                        let consecutive = entry.pool.record_failure(&e);
                        entry.breaker.on_failure(consecutive);
                        tracing::debug!(
                            server = %server_id,
                            error = %e,
                            tries,
                            "segment attempt failed"
                        );
                        last_error = Some(e);
                        // One fresh-connection retry on the same server
                        if tries >= 2 || !entry.breaker.try_acquire() {
                            break;
                        }
                    }
                }
            }
        }
        self.publish_activity();

        if not_found == attempted && not_found > 0 {
            self.cache_missing(message_id);
            return Err(Error::NotFound(format!("article <{message_id}>")));
        }
        match last_error {
            Some(Error::Transient(msg)) => Err(Error::Transient(msg)),
            Some(e) => Err(Error::Transient(format!("all servers failed: {e}"))),
            None => Err(Error::Transient(format!(
                "article <{message_id}> unavailable on all servers"
            ))),
        }
    }

    async fn attempt(
        &self,
        entry: &ServerEntry,
        message_id: &str,
        op: &FetchOp,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut pooled = entry.pool.acquire(cancel).await?;
        self.publish_activity();

        // On cancellation the in-flight command leaves the wire dirty; the
        // select drops the call future first, then the session is poisoned
        macro_rules! with_cancel {
            ($fut:expr) => {{
                let outcome = tokio::select! {
                    result = $fut => Some(result),
                    _ = cancel.cancelled() => None,
                };
                match outcome {
                    Some(result) => result,
                    None => {
                        pooled.mark_broken();
                        return Err(Error::Cancelled);
                    }
                }
            }};
        }

        match op {
            FetchOp::Stat => {
                let exists = with_cancel!(pooled.conn().stat(message_id))?;
                if exists {
                    Ok(FetchOutcome::Present)
                } else {
                    Err(Error::NotFound(format!("article <{message_id}>")))
                }
            }
            FetchOp::Header => {
                let header = with_cancel!(pooled.conn().begin_body(message_id))?;
                // The body is already in flight; reading it out keeps the
                // session reusable, which beats a reconnect round-trip
                with_cancel!(pooled.conn().drain_body())?;
                Ok(FetchOutcome::Header(header))
            }
            FetchOp::Stream => {
                let header = with_cancel!(pooled.conn().begin_body(message_id))?;
                Ok(FetchOutcome::Stream(SegmentStream::live(header, pooled)))
            }
        }
    }

    fn is_cached_missing(&self, message_id: &str) -> bool {
        self.lock_missing().contains(&message_id.to_string())
    }

    fn cache_missing(&self, message_id: &str) {
        self.lock_missing().insert(message_id.to_string(), ());
    }

    fn cached_header(&self, message_id: &str) -> Option<YencHeader> {
        self.lock_headers().get(&message_id.to_string())
    }

    fn cache_header(&self, message_id: &str, header: &YencHeader) {
        self.lock_headers()
            .insert(message_id.to_string(), header.clone());
    }

    fn publish_activity(&self) {
        let Some(events) = &self.events else { return };
        let in_use: usize = self.entries.iter().map(|e| e.pool.in_use()).sum();
        let activity = if in_use == 0 {
            ConnectionActivity::Idle
        } else if self.entries.iter().all(|e| e.pool.is_saturated()) {
            ConnectionActivity::Max
        } else {
            ConnectionActivity::Live
        };
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *last != activity {
            *last = activity;
            events.publish(Event::ConnectionActivity { activity });
        }
    }

    fn lock_missing(&self) -> std::sync::MutexGuard<'_, TtlLru<String, ()>> {
        self.missing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_headers(&self) -> std::sync::MutexGuard<'_, TtlLru<String, YencHeader>> {
        self.headers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SegmentFetcher for MultiServerClient {
    async fn fetch_segment(
        &self,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SegmentStream> {
        match self.route(message_id, FetchOp::Stream, cancel).await? {
            FetchOutcome::Stream(stream) => {
                self.cache_header(message_id, stream.header());
                Ok(stream)
            }
            _ => Err(Error::Protocol("route returned wrong outcome".into())),
        }
    }

    async fn fetch_header(
        &self,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<YencHeader> {
        if let Some(header) = self.cached_header(message_id) {
            return Ok(header);
        }
        match self.route(message_id, FetchOp::Header, cancel).await? {
            FetchOutcome::Header(header) => {
                self.cache_header(message_id, &header);
                Ok(header)
            }
            _ => Err(Error::Protocol("route returned wrong outcome".into())),
        }
    }

    async fn stat(&self, message_id: &str, cancel: &CancellationToken) -> Result<bool> {
        match self.route(message_id, FetchOp::Stat, cancel).await {
            Ok(FetchOutcome::Present) => Ok(true),
            Ok(_) => Err(Error::Protocol("route returned wrong outcome".into())),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
