//! # usenet-fs
//!
//! Usenet-backed virtual filesystem and download-manager backend library.
//!
//! Clients hand in NZB job descriptors; the pipeline validates article
//! availability across a fleet of NNTP servers, registers a virtual
//! directory tree pointing at the remote articles, and streams file contents
//! on demand by fetching yEnc-encoded segments and decoding them inline.
//! Files inside RAR/7z/multipart-MKV containers are exposed as individually
//! seekable virtual files without ever materializing the archive.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - no CLI or UI; WebDAV and REST adapters embed this crate
//! - **Event-driven** - adapters subscribe to topics, no polling required
//! - **Nothing on disk** - archives are mapped onto segment byte ranges, never extracted
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_fs::{Config, ServerConfig, UsenetFs};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             id: "primary".into(),
//!             name: "Primary".into(),
//!             host: "news.example.com".into(),
//!             port: 563,
//!             tls: true,
//!             user: Some("user".into()),
//!             pass: Some("pass".into()),
//!             max_connections: 10,
//!             priority: 0,
//!             enabled: true,
//!             retention_days: None,
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let fs = UsenetFs::new(config).await?;
//!     fs.start();
//!
//!     let nzb = std::fs::read("example.nzb")?;
//!     let id = fs
//!         .enqueue(&nzb, "example.nzb", "movies", Default::default(), Default::default())
//!         .await?;
//!     println!("queued job {id}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Topic-addressed event bus
pub mod events;
/// NNTP connections, pools, and the multi-server client
pub mod nntp;
/// NZB job pipeline
pub mod pipeline;
/// Queue manager
pub mod queue;
/// Virtual-file reader
pub mod reader;
/// Retry helper with exponential backoff
pub mod retry;
/// Service facade
pub mod service;
/// Virtual item store
pub mod store;
/// Core types
pub mod types;
/// Utility functions (download keys, name handling)
pub mod utils;
/// yEnc prologue parsing and decoding
pub mod yenc;

pub use config::{
    ClientConfig, Config, DuplicateNzbBehavior, HealthCheckConfig, ImportConfig, ImportStrategy,
    PersistenceConfig, QueueConfig, SecurityConfig, ServerConfig,
};
pub use error::{Error, IsRetryable, Result};
pub use events::{ConnectionActivity, Event, EventBus, Subscription, Topic, TopicKind};
pub use nntp::{
    CircuitBreaker, CircuitState, MultiServerClient, SegmentCheckReport, SegmentFetcher,
    SegmentStream, ServerPool,
};
pub use service::UsenetFs;
pub use store::Store;
pub use types::{
    AesParams, ByteRange, FilePart, HistoryItem, ItemId, ItemType, JobId, JobStatus,
    MultipartMeta, PartSegment, PostProcessing, Priority, QueueItem, SegmentRef, ServerHealth,
    VirtualItem, YencHeader,
};

/// Helper to run the service until a termination signal arrives
///
/// Listens for SIGTERM/SIGINT on Unix (Ctrl+C elsewhere), then calls
/// [`UsenetFs::shutdown`].
pub async fn run_with_shutdown(fs: UsenetFs) {
    wait_for_signal().await;
    fs.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests); fall back to ctrl_c
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        _ => {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received Ctrl+C");
}
