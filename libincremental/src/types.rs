use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type StorageId = i32;
pub type MountId = i32;

pub const INVALID_STORAGE_ID: StorageId = -1;
pub const MAX_STORAGE_ID: StorageId = i32::MAX - 1;
/// Owner id of jobs that concern every storage at once.
pub const ALL_STORAGES_ID: StorageId = MAX_STORAGE_ID + 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateOptions: u32 {
        const TEMPORARY_BIND = 1;
        const PERMANENT_BIND = 2;
        const CREATE_NEW = 4;
        const OPEN_EXISTING = 8;
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self::TEMPORARY_BIND
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindKind {
    Temporary,
    Permanent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLoaderType {
    #[default]
    None,
    Streaming,
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLoaderParams {
    #[serde(rename = "type")]
    pub kind: DataLoaderType,
    pub package_name: String,
    pub class_name: String,
    pub arguments: String,
}

/// Health thresholds supplied with a storage health listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckParams {
    pub blocked_timeout: Duration,
    pub unhealthy_timeout: Duration,
    pub unhealthy_monitoring: Duration,
}

impl HealthCheckParams {
    pub fn is_valid(&self) -> bool {
        !self.blocked_timeout.is_zero() && self.blocked_timeout < self.unhealthy_timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    Ok,
    ReadsPending,
    Blocked,
    Unhealthy,
    UnhealthyStorage,
    UnhealthyTransport,
}

impl HealthStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ReadsPending => 1,
            Self::Blocked => 2,
            Self::Unhealthy => 3,
            Self::UnhealthyStorage => 4,
            Self::UnhealthyTransport => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLoaderStatus {
    Destroyed,
    Binding,
    Bound,
    Created,
    Started,
    Stopped,
    Unavailable,
    Unrecoverable,
}

impl DataLoaderStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Destroyed => 0,
            Self::Binding => 1,
            Self::Bound => 2,
            Self::Created => 3,
            Self::Started => 4,
            Self::Stopped => 5,
            Self::Unavailable => 8,
            Self::Unrecoverable => 9,
        }
    }
}

/// Stream condition reported by the data loader itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamStatus {
    #[default]
    Healthy,
    IntegrityError,
    SourceError,
    StorageError,
    TransportError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Full,
    MissingBlocks,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingProgress {
    pub filled_blocks: i64,
    pub total_blocks: i64,
}

impl LoadingProgress {
    pub fn started(&self) -> bool {
        self.total_blocks > 0
    }

    pub fn fully_loaded(&self) -> bool {
        self.filled_blocks == self.total_blocks
    }

    pub fn progress(&self) -> f32 {
        if self.total_blocks <= 0 {
            return 1.0;
        }
        self.filled_blocks as f32 / self.total_blocks as f32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerUidReadTimeouts {
    pub uid: i32,
    pub min_time_us: u64,
    pub min_pending_time_us: u64,
    pub max_pending_time_us: u64,
}

/// Opaque 16-byte file identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub [u8; 16]);

impl FileId {
    /// Derives an id from file metadata, the way files created through the
    /// service are identified.
    pub fn from_metadata(metadata: &[u8]) -> Self {
        let digest = Sha256::digest(metadata);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != [0u8; 16]
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({self})")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewFileParams {
    pub size: i64,
    pub metadata: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRead {
    pub id: FileId,
    pub block: i32,
    pub boot_clock_ts_us: u64,
    pub uid: i32,
}

/// Snapshot handed to mount state callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfsState {
    pub fully_loaded: bool,
    pub read_logs_enabled: bool,
    pub error: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncFsMetrics {
    pub reads_delayed_min: u32,
    pub reads_delayed_min_us: u64,
    pub reads_delayed_pending: u32,
    pub reads_delayed_pending_us: u64,
    pub reads_failed_hash_verification: u32,
    pub reads_failed_other: u32,
    pub reads_failed_timed_out: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadError {
    pub id: FileId,
    pub timestamp_us: u64,
    pub block: i32,
    pub error_no: i32,
    pub uid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i32),
    Long(i64),
}

impl MetricValue {
    /// Whole milliseconds of `elapsed`, saturating at `i64::MAX`.
    pub fn millis(elapsed: Duration) -> Self {
        Self::Long(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }
}

pub mod metric_keys {
    pub const READ_LOGS_ENABLED: &str = "readLogsEnabled";
    pub const TOTAL_DELAYED_READS: &str = "totalDelayedReads";
    pub const TOTAL_FAILED_READS: &str = "totalFailedReads";
    pub const TOTAL_DELAYED_READS_MILLIS: &str = "totalDelayedReadsMillis";
    pub const MILLIS_SINCE_LAST_READ_ERROR: &str = "millisSinceLastReadError";
    pub const LAST_READ_ERROR_NO: &str = "lastReadErrorNo";
    pub const LAST_READ_ERROR_UID: &str = "lastReadErrorUid";
    pub const MILLIS_SINCE_OLDEST_PENDING_READ: &str = "millisSinceOldestPendingRead";
    pub const STORAGE_HEALTH_STATUS_CODE: &str = "storageHealthStatusCode";
    pub const DATA_LOADER_STATUS_CODE: &str = "dataLoaderStatusCode";
    pub const MILLIS_SINCE_LAST_DATA_LOADER_BIND: &str = "millisSinceLastDataLoaderBind";
    pub const DATA_LOADER_BIND_DELAY_MILLIS: &str = "dataLoaderBindDelayMillis";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<&'static str, MetricValue>);

impl Metrics {
    pub fn put(&mut self, key: &'static str, value: MetricValue) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<MetricValue> {
        self.0.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
