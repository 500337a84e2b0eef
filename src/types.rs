//! Core types for usenet-fs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a virtual item
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a queued job; the matching history row reuses it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of a virtual item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Directory node
    Dir,
    /// Plain file backed by a contiguous yEnc segment run
    File,
    /// File assembled from parts (archive entry, multipart join)
    MultipartFile,
    /// Symlink pointing at another virtual path
    Symlink,
}

impl ItemType {
    /// Convert integer type code to ItemType
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ItemType::Dir,
            1 => ItemType::File,
            2 => ItemType::MultipartFile,
            3 => ItemType::Symlink,
            _ => ItemType::File,
        }
    }

    /// Convert ItemType to integer type code
    pub fn to_i32(self) -> i32 {
        match self {
            ItemType::Dir => 0,
            ItemType::File => 1,
            ItemType::MultipartFile => 2,
            ItemType::Symlink => 3,
        }
    }
}

/// A node in the virtual directory tree
///
/// Parent-child relationships are modeled by id, not pointer; the store is
/// the single source of truth. `(parent_id, name)` is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualItem {
    /// Unique identifier
    pub id: ItemId,

    /// Parent directory (None only for the well-known roots)
    pub parent_id: Option<ItemId>,

    /// Name within the parent directory
    pub name: String,

    /// Item kind
    pub item_type: ItemType,

    /// Logical size in bytes (0 for directories)
    pub size: u64,

    /// When the item was created
    pub created_at: DateTime<Utc>,

    /// Poster-declared release date, when known
    pub release_date: Option<DateTime<Utc>>,

    /// When the last article-existence sweep covered this item
    pub last_health_check_at: Option<DateTime<Utc>>,
}

/// Half-open byte range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Inclusive start offset
    pub start: u64,
    /// Exclusive end offset
    pub end: u64,
}

impl ByteRange {
    /// Construct a range; `end` must not precede `start`
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(end >= start);
        Self { start, end }
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True when the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when `offset` falls inside the range
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// yEnc prologue fields for one segment
///
/// Derived from the `=ybegin`/`=ypart` lines; cached keyed by message-id so
/// repeated range reads skip the prologue fetch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YencHeader {
    /// Poster-declared filename
    pub file_name: String,
    /// Part number within the file (absent for single-part posts)
    pub part_number: Option<u32>,
    /// Offset of this part's first byte within the decoded file
    pub part_offset: u64,
    /// Decoded size of this part
    pub part_size: u64,
    /// Declared size of the whole decoded file
    pub total_size: u64,
    /// Optional part CRC32 from the `=yend` trailer
    pub crc32: Option<u32>,
}

/// One segment reference within a file's ordered run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Usenet message-id (unique lookup key on any server)
    pub message_id: String,
    /// 1-based part number
    pub part_number: u32,
    /// Offset of the segment's decoded bytes within the file
    pub part_offset: u64,
    /// Decoded size of the segment
    pub part_size: u64,
}

/// Segment slice referenced by a [`FilePart`], with its position inside the
/// source volume's decoded byte run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSegment {
    /// Usenet message-id
    pub message_id: String,
    /// Offset of the segment's decoded bytes within the source volume
    pub volume_offset: u64,
    /// Decoded size of the segment
    pub size: u64,
}

/// One contiguous slice of a multipart virtual file
///
/// Invariant: `part_range.len() == segment_range.len()`. Parts are sorted;
/// their concatenation defines the virtual file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    /// Segments backing this part, in volume order
    pub segments: Vec<PartSegment>,
    /// Byte range inside the source volume's decoded run
    pub segment_range: ByteRange,
    /// Byte range inside the virtual file
    pub part_range: ByteRange,
}

impl FilePart {
    /// Check the defining length invariant
    pub fn is_consistent(&self) -> bool {
        self.part_range.len() == self.segment_range.len()
    }
}

/// AES-CBC parameters for an encrypted archive entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesParams {
    /// Derived 256-bit key
    pub key: Vec<u8>,
    /// 128-bit initialization vector
    pub iv: Vec<u8>,
}

/// Metadata attached to `multipart_file` items
///
/// Invariant: the part ranges tile `[0, size)` of the owning item unless
/// `aes` dictates a decoded size.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartMeta {
    /// Present for encrypted RAR entries
    pub aes: Option<AesParams>,
    /// Ordered parts whose concatenation is the file
    pub file_parts: Vec<FilePart>,
}

/// Job priority
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Force — ahead of everything (2)
    Force = 2,
}

impl Priority {
    /// Convert integer priority code to Priority
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            -1 => Priority::Low,
            0 => Priority::Normal,
            1 => Priority::High,
            2 => Priority::Force,
            _ => Priority::Normal,
        }
    }
}

/// SAB-style post-processing request recorded with a job
///
/// The core registers virtual items rather than unpacking, so this is stored
/// for adapter fidelity and echoed back in listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessing {
    /// No post-processing requested
    #[default]
    Skip,
    /// Verify/repair requested
    Repair,
    /// Repair + unpack requested
    Unpack,
    /// Repair + unpack + delete requested
    Delete,
}

impl PostProcessing {
    /// Convert integer code to PostProcessing
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => PostProcessing::Repair,
            2 => PostProcessing::Unpack,
            3 => PostProcessing::Delete,
            _ => PostProcessing::Skip,
        }
    }

    /// Convert PostProcessing to integer code
    pub fn to_i32(self) -> i32 {
        match self {
            PostProcessing::Skip => 0,
            PostProcessing::Repair => 1,
            PostProcessing::Unpack => 2,
            PostProcessing::Delete => 3,
        }
    }
}

/// A job waiting in (or deferred back to) the queue
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique job identifier
    pub id: JobId,

    /// Original NZB filename
    pub file_name: String,

    /// Job name (mount folder name; from NZB meta title or the filename)
    pub job_name: String,

    /// Category under the content root
    pub category: String,

    /// Raw NZB document
    #[serde(skip_serializing)]
    pub nzb_contents: String,

    /// Job priority
    pub priority: Priority,

    /// Ineligible until this instant (set when a job is deferred)
    pub pause_until: Option<DateTime<Utc>>,

    /// Sum of declared segment sizes
    pub total_segment_bytes: u64,

    /// Requested post-processing mode
    pub post_processing: PostProcessing,

    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
}

/// Terminal status of a finished job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job completed and its items were registered
    Completed,
    /// Job failed; no items were registered
    Failed,
}

impl JobStatus {
    /// Convert integer status code to JobStatus
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    /// Convert JobStatus to integer status code
    pub fn to_i32(self) -> i32 {
        match self {
            JobStatus::Completed => 0,
            JobStatus::Failed => 1,
        }
    }
}

/// Historical record of a finished job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Job identifier (same id the queue row carried)
    pub id: JobId,

    /// Job name
    pub job_name: String,

    /// Category under the content root
    pub category: String,

    /// Terminal status
    pub status: JobStatus,

    /// Sum of declared segment sizes
    pub total_segment_bytes: u64,

    /// Wall-clock processing time in seconds
    pub download_time_seconds: u64,

    /// Single-line failure message (failed jobs only)
    pub fail_message: Option<String>,

    /// Mount folder of the registered items (completed jobs only)
    pub download_dir_id: Option<ItemId>,

    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
}

/// Aggregate health of one configured server
///
/// Mutated only by the owning pool under its lock; readers get snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerHealth {
    /// Server this record belongs to
    pub server_id: String,
    /// False once an Unauthorized/Fatal error disabled the server
    pub available: bool,
    /// Failures since the last success (drives the circuit breaker)
    pub consecutive_failures: u32,
    /// Lifetime successful calls
    pub total_successes: u64,
    /// Lifetime failed calls
    pub total_failures: u64,
    /// Lifetime 430/423 responses (not failures)
    pub total_articles_not_found: u64,
    /// Instant of the last success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Instant of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Message of the last failure
    pub last_error: Option<String>,
}

impl ServerHealth {
    /// Fresh health record for a server
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            available: true,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            total_articles_not_found: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }
}
