//! Interface of the block-oriented incremental storage primitive.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::control::Control;
use crate::types::{
    FileId, IncFsMetrics, LoadingState, NewFileParams, PendingRead, PerUidReadTimeouts, ReadError,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Mapped files, per-uid timeouts and precise space accounting.
        const V2 = 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    HaveData,
    Timeout,
    Error(Errno),
}

#[derive(Debug)]
pub struct DataBlock<'a> {
    pub file: BorrowedFd<'a>,
    pub page_index: u32,
    pub data: &'a [u8],
}

/// A mount that is still present after the service restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingMount {
    pub root: String,
    pub backing_dir: String,
    /// (source inside `<root>/mount`, bind target) pairs.
    pub binds: Vec<(String, String)>,
}

pub trait IncFs: Send + Sync {
    fn features(&self) -> Features;

    /// Opens the control channels of the mount at `dir`.
    fn open_mount(&self, dir: &str) -> Option<Control>;

    fn make_file(
        &self,
        control: &Control,
        path: &str,
        mode: u32,
        id: FileId,
        params: &NewFileParams,
    ) -> Result<(), Errno>;

    fn make_mapped_file(
        &self,
        control: &Control,
        path: &str,
        mode: u32,
        source: FileId,
        offset: u64,
        size: u64,
    ) -> Result<(), Errno>;

    fn make_dir(&self, control: &Control, path: &str, mode: u32) -> Result<(), Errno>;

    fn make_dirs(&self, control: &Control, path: &str, mode: u32) -> Result<(), Errno>;

    fn get_metadata(&self, control: &Control, id: FileId) -> Result<Vec<u8>, Errno>;

    fn get_metadata_by_path(&self, control: &Control, path: &str) -> Result<Vec<u8>, Errno>;

    fn get_file_id(&self, control: &Control, path: &str) -> Result<FileId, Errno>;

    /// Returns (filled, total) data blocks of a file.
    fn count_filled_blocks(&self, control: &Control, path: &str) -> Result<(i64, i64), Errno>;

    fn is_file_fully_loaded(&self, control: &Control, path: &str) -> Result<LoadingState, Errno>;

    fn is_file_fully_loaded_by_id(
        &self,
        control: &Control,
        id: FileId,
    ) -> Result<LoadingState, Errno>;

    fn is_everything_fully_loaded(&self, control: &Control) -> Result<LoadingState, Errno>;

    fn link(&self, control: &Control, from: &str, to: &str) -> Result<(), Errno>;

    fn unlink(&self, control: &Control, path: &str) -> Result<(), Errno>;

    fn open_for_special_ops(&self, control: &Control, id: FileId) -> Result<OwnedFd, Errno>;

    fn write_blocks(&self, blocks: &[DataBlock<'_>]) -> Result<usize, Errno>;

    /// Reserves `size` bytes for a file; `None` trims the reservation.
    fn reserve_space(&self, control: &Control, id: FileId, size: Option<u64>)
    -> Result<(), Errno>;

    fn wait_for_pending_reads(
        &self,
        control: &Control,
        timeout: Duration,
        reads: &mut Vec<PendingRead>,
    ) -> WaitResult;

    fn set_uid_read_timeouts(
        &self,
        control: &Control,
        timeouts: &[PerUidReadTimeouts],
    ) -> Result<(), Errno>;

    /// Calls `f` for every file of the mount until it returns `false`.
    fn for_each_file(
        &self,
        control: &Control,
        f: &mut dyn FnMut(FileId) -> bool,
    ) -> Result<(), Errno>;

    fn get_metrics(&self, metrics_key: &str) -> Option<IncFsMetrics>;

    fn get_last_read_error(&self, control: &Control) -> Option<ReadError>;

    fn list_existing_mounts(&self) -> Vec<ExistingMount>;
}
