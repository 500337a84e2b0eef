//! Per-server connection pool
//!
//! A bounded set of authenticated sessions. Lending is FIFO-fair through a
//! semaphore; idle connections are reused, broken ones are closed and
//! replaced without counting against capacity. The pool is the sole owner of
//! the server's [`ServerHealth`] record.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::types::ServerHealth;

use super::connection::NntpConnection;

/// Bounded pool of connections to one server
pub struct ServerPool {
    config: ServerConfig,
    client_config: ClientConfig,
    semaphore: Arc<tokio::sync::Semaphore>,
    idle: Mutex<Vec<NntpConnection>>,
    health: Mutex<ServerHealth>,
}

impl ServerPool {
    /// Create an empty pool for a server; connections are dialed on demand
    pub fn new(config: ServerConfig, client_config: ClientConfig) -> Arc<Self> {
        let capacity = config.max_connections;
        Arc::new(Self {
            health: Mutex::new(ServerHealth::new(config.id.clone())),
            config,
            client_config,
            semaphore: Arc::new(tokio::sync::Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    /// Server configuration this pool serves
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Borrow a connection, dialing a fresh one when no idle session exists
    ///
    /// Waits FIFO when the pool is at capacity. Fails fast when the server
    /// has been disabled by an authentication failure.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<PooledConnection> {
        if !self.snapshot().available {
            return Err(Error::Fatal(format!(
                "server '{}' is disabled until reconfigured",
                self.config.id
            )));
        }

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Error::Transient("pool closed".into()))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConnection {
                conn: Some(conn),
                pool: Arc::clone(self),
                _permit: permit,
            });
        }

        let dial = NntpConnection::connect(&self.config, &self.client_config);
        let conn = tokio::select! {
            result = dial => result,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        match conn {
            Ok(conn) => Ok(PooledConnection {
                conn: Some(conn),
                pool: Arc::clone(self),
                _permit: permit,
            }),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Number of connections currently lent out
    pub fn in_use(&self) -> usize {
        self.config.max_connections - self.semaphore.available_permits()
    }

    /// True when every connection is lent out
    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Snapshot of the server's health record
    pub fn snapshot(&self) -> ServerHealth {
        self.lock_health().clone()
    }

    /// Record a successful call (data returned)
    pub fn record_success(&self) {
        let mut health = self.lock_health();
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.last_success_at = Some(chrono::Utc::now());
    }

    /// Record a definitive 430/423 — a success that bumps the not-found count
    pub fn record_not_found(&self) {
        let mut health = self.lock_health();
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.total_articles_not_found += 1;
        health.last_success_at = Some(chrono::Utc::now());
    }

    /// Record a failure; Unauthorized/Fatal disables the server.
    ///
    /// Returns the consecutive-failure count so the caller can feed the
    /// circuit breaker.
    pub fn record_failure(&self, error: &Error) -> u32 {
        let mut health = self.lock_health();
        match error {
            Error::Unauthorized(_) | Error::Fatal(_) => {
                health.available = false;
                health.last_failure_at = Some(chrono::Utc::now());
                health.last_error = Some(error.to_string());
                tracing::warn!(
                    server = %self.config.id,
                    error = %error,
                    "server disabled until reconfigured"
                );
            }
            Error::Cancelled => {}
            _ => {
                health.consecutive_failures += 1;
                health.total_failures += 1;
                health.last_failure_at = Some(chrono::Utc::now());
                health.last_error = Some(error.to_string());
            }
        }
        health.consecutive_failures
    }

    fn pop_idle(&self) -> Option<NntpConnection> {
        self.lock_idle().pop()
    }

    fn return_connection(&self, conn: NntpConnection) {
        if conn.is_clean() {
            self.lock_idle().push(conn);
        }
        // Broken connections are dropped here; the freed permit lets the next
        // borrower dial a replacement
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, ServerHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<NntpConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A connection on loan from a [`ServerPool`]
///
/// Returning or dropping it gives the session back to the pool in `idle` if
/// the protocol state is clean, otherwise the session is closed.
pub struct PooledConnection {
    conn: Option<NntpConnection>,
    pool: Arc<ServerPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Access the underlying session
    pub fn conn(&mut self) -> &mut NntpConnection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("taken only in Drop"))
    }

    /// Poison the session so it is closed instead of reused
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }

    /// Pool this connection belongs to (for health recording mid-stream)
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<ServerPool> {
        let server = ServerConfig {
            id: "s1".to_string(),
            name: String::new(),
            host: "127.0.0.1".to_string(),
            port: 119,
            tls: false,
            user: None,
            pass: None,
            max_connections: 2,
            priority: 0,
            enabled: true,
            retention_days: None,
        };
        ServerPool::new(server, ClientConfig::default())
    }

    #[test]
    fn not_found_counts_as_success() {
        let pool = pool();
        pool.record_failure(&Error::Transient("t".into()));
        pool.record_not_found();

        let health = pool.snapshot();
        assert_eq!(health.consecutive_failures, 0, "NotFound resets the streak");
        assert_eq!(health.total_successes, 1);
        assert_eq!(health.total_articles_not_found, 1);
        assert_eq!(health.total_failures, 1);
        assert!(health.available);
    }

    #[test]
    fn transient_failures_accumulate() {
        let pool = pool();
        for i in 1..=3 {
            let consecutive = pool.record_failure(&Error::Transient("boom".into()));
            assert_eq!(consecutive, i);
        }
        let health = pool.snapshot();
        assert_eq!(health.total_failures, 3);
        assert!(health.last_error.as_deref().unwrap().contains("boom"));
        assert!(health.available);
    }

    #[test]
    fn unauthorized_disables_the_server() {
        let pool = pool();
        pool.record_failure(&Error::Unauthorized("480".into()));
        assert!(!pool.snapshot().available);
    }

    #[test]
    fn cancellation_does_not_touch_health() {
        let pool = pool();
        pool.record_failure(&Error::Cancelled);
        let health = pool.snapshot();
        assert_eq!(health.total_failures, 0);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.available);
    }

    #[tokio::test]
    async fn acquire_fails_fast_on_disabled_server() {
        let pool = pool();
        pool.record_failure(&Error::Fatal("bad credentials".into()));
        let cancel = CancellationToken::new();
        let result = pool.acquire(&cancel).await;
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn acquire_honors_cancellation_while_waiting() {
        let pool = pool();
        // Exhaust permits without dialing by forgetting them
        let p1 = pool.semaphore.clone().acquire_owned().await.unwrap();
        let p2 = pool.semaphore.clone().acquire_owned().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pool.acquire(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        drop((p1, p2));
    }
}
