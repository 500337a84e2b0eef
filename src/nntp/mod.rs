//! NNTP layer: single connections, per-server pools, and the multi-server
//! client with failover and circuit breaking.

mod cache;
mod circuit;
mod client;
mod connection;
mod pool;
mod stream;

pub use cache::TtlLru;
pub use circuit::{CircuitBreaker, CircuitState};
pub use client::{MultiServerClient, SegmentCheckReport, SegmentFetcher};
pub use connection::NntpConnection;
pub use pool::{PooledConnection, ServerPool};
pub use stream::SegmentStream;
