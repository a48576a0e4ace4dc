//! In-memory collaborators for unit tests.
//!
//! The fakes keep real files under a temporary directory so path handling and
//! cleanup are exercised for real; only the incremental filesystem semantics,
//! mounting and the remote loader are simulated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tempfile::TempDir;

use crate::archive::{Archive, ArchiveEntry, ArchiveReader};
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::control::Control;
use crate::fs::WalkDirFs;
use crate::incfs::{DataBlock, ExistingMount, Features, IncFs, WaitResult};
use crate::jobs::{Job, Looper, LooperCallback, TimedQueue};
use crate::loader::{DataLoader, DataLoaderManager, DataLoaderStatusListener, FileSystemControl};
use crate::mounter::MountService;
use crate::path;
use crate::permissions::MockAppOps;
use crate::service::{IncrementalService, ServiceDeps};
use crate::types::{
    DataLoaderParams, DataLoaderStatus, FileId, IncFsMetrics, LoadingState, MountId,
    NewFileParams, PendingRead, PerUidReadTimeouts, ReadError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn errno_of(e: &io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

pub fn dev_null_control() -> Control {
    let open = || -> OwnedFd { File::open("/dev/null").unwrap().into() };
    Control::new(open(), open(), Some(open()), None)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct FakeClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub const BOOT_BASE_US: u64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }

    fn advance_to(&self, at: Instant) {
        let mut offset = lock(&self.offset);
        let target = at.saturating_duration_since(self.base);
        if target > *offset {
            *offset = target;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *lock(&self.offset)
    }

    fn boot_time_us(&self) -> u64 {
        Self::BOOT_BASE_US + lock(&self.offset).as_micros() as u64
    }
}

struct QueuedJob {
    id: MountId,
    due: Instant,
    seq: u64,
    job: Job,
}

/// Timed queue driven by [`ManualTimedQueue::advance`] on the test thread.
pub struct ManualTimedQueue {
    clock: Arc<FakeClock>,
    jobs: Mutex<(u64, Vec<QueuedJob>)>,
    stopped: AtomicBool,
}

impl ManualTimedQueue {
    pub fn new(clock: Arc<FakeClock>) -> Self {
        Self {
            clock,
            jobs: Mutex::new((0, Vec::new())),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn pending(&self, id: MountId) -> usize {
        lock(&self.jobs).1.iter().filter(|j| j.id == id).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).1.len()
    }

    /// Moves the clock forward by `by`, running every job that comes due on
    /// the way in due order.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.now() + by;
        loop {
            let next = {
                let mut jobs = lock(&self.jobs);
                let earliest = jobs
                    .1
                    .iter()
                    .enumerate()
                    .filter(|(_, j)| j.due <= target)
                    .min_by_key(|(_, j)| (j.due, j.seq))
                    .map(|(pos, _)| pos);
                earliest.map(|pos| jobs.1.swap_remove(pos))
            };
            let Some(next) = next else {
                break;
            };
            self.clock.advance_to(next.due);
            (next.job)();
        }
        self.clock.advance_to(target);
    }
}

impl TimedQueue for ManualTimedQueue {
    fn add_job(&self, id: MountId, after: Duration, job: Job) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let due = self.clock.now() + after;
        let mut jobs = lock(&self.jobs);
        jobs.0 += 1;
        let seq = jobs.0;
        jobs.1.push(QueuedJob { id, due, seq, job });
    }

    fn remove_jobs(&self, id: MountId) {
        let removed: Vec<QueuedJob> = {
            let mut jobs = lock(&self.jobs);
            let (gone, kept) = std::mem::take(&mut jobs.1)
                .into_iter()
                .partition(|j| j.id == id);
            jobs.1 = kept;
            gone
        };
        drop(removed);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let removed = std::mem::take(&mut lock(&self.jobs).1);
        drop(removed);
    }
}

#[derive(Default)]
struct MounterState {
    /// incfs mount target -> backing dir
    mounts: BTreeMap<String, String>,
    /// bind target -> source
    binds: BTreeMap<String, String>,
    unmounted: Vec<String>,
    options: Vec<(bool, bool)>,
    fail_mount: bool,
    fail_bind: bool,
    fail_options: bool,
}

/// Records mounts and binds. An unmounted image keeps its content under the
/// backing dir and gets it back on the next mount.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<MounterState>,
}

const IMAGE_DIR: &str = ".image";

fn move_entries(from: &str, to: &str) {
    let Ok(entries) = fs::read_dir(from) else {
        return;
    };
    let _ = fs::create_dir_all(to);
    for entry in entries.flatten() {
        let _ = fs::rename(entry.path(), Path::new(to).join(entry.file_name()));
    }
}

impl FakeMounter {
    pub fn fail_mount(&self, fail: bool) {
        lock(&self.state).fail_mount = fail;
    }

    pub fn fail_bind(&self, fail: bool) {
        lock(&self.state).fail_bind = fail;
    }

    pub fn fail_options(&self, fail: bool) {
        lock(&self.state).fail_options = fail;
    }

    pub fn is_bound(&self, target: &str) -> bool {
        lock(&self.state).binds.contains_key(target)
    }

    pub fn mounted(&self) -> Vec<String> {
        lock(&self.state).mounts.keys().cloned().collect()
    }

    pub fn unmounted(&self) -> Vec<String> {
        lock(&self.state).unmounted.clone()
    }

    /// (read logs, read timeouts) of every option change, oldest first.
    pub fn options(&self) -> Vec<(bool, bool)> {
        lock(&self.state).options.clone()
    }

    /// What the storage primitive would report as still mounted.
    pub fn existing_mounts(&self) -> Vec<ExistingMount> {
        let state = lock(&self.state);
        state
            .mounts
            .iter()
            .map(|(root, backing)| ExistingMount {
                root: root.clone(),
                backing_dir: backing.clone(),
                binds: state
                    .binds
                    .iter()
                    .filter_map(|(target, source)| {
                        let relative = path::relativize(root, source)?;
                        Some((relative.to_string(), target.clone()))
                    })
                    .collect(),
            })
            .collect()
    }

    /// Drops every mount and bind without telling anyone.
    pub fn reboot(&self) {
        let mut state = lock(&self.state);
        state.binds.clear();
        for (root, backing) in std::mem::take(&mut state.mounts) {
            move_entries(&root, &path::join(&backing, IMAGE_DIR));
        }
    }
}

impl MountService for FakeMounter {
    fn mount_incfs(
        &self,
        backing_dir: &str,
        target_dir: &str,
        _metrics_key: &str,
    ) -> Result<Control, Errno> {
        let mut state = lock(&self.state);
        if state.fail_mount {
            return Err(Errno::EIO);
        }
        if !Path::new(backing_dir).is_dir() || !Path::new(target_dir).is_dir() {
            return Err(Errno::ENOENT);
        }
        move_entries(&path::join(backing_dir, IMAGE_DIR), target_dir);
        let _ = fs::remove_dir(path::join(backing_dir, IMAGE_DIR));
        state
            .mounts
            .insert(target_dir.to_string(), backing_dir.to_string());
        Ok(dev_null_control())
    }

    fn unmount_incfs(&self, dir: &str) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        state.unmounted.push(dir.to_string());
        if state.binds.remove(dir).is_some() {
            return Ok(());
        }
        match state.mounts.remove(dir) {
            Some(backing) => {
                move_entries(dir, &path::join(&backing, IMAGE_DIR));
                Ok(())
            }
            None => Err(Errno::EINVAL),
        }
    }

    fn bind_mount(&self, source: &str, target: &str) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if state.fail_bind {
            return Err(Errno::EPERM);
        }
        state.binds.insert(target.to_string(), source.to_string());
        Ok(())
    }

    fn set_incfs_mount_options(
        &self,
        _control: Control,
        enable_read_logs: bool,
        enable_read_timeouts: bool,
        _metrics_key: &str,
    ) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if state.fail_options {
            return Err(Errno::EIO);
        }
        state.options.push((enable_read_logs, enable_read_timeouts));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeFile {
    id: FileId,
    metadata: Vec<u8>,
    size: u64,
}

struct IncFsState {
    features: Features,
    files: HashMap<String, FakeFile>,
    everything: LoadingState,
    pending_reads: Vec<PendingRead>,
    written: Vec<(FileId, u32, usize)>,
    reserved: Vec<(FileId, Option<u64>)>,
    mapped: Vec<String>,
    uid_timeouts: Vec<Vec<PerUidReadTimeouts>>,
    reserve_error: Option<Errno>,
    open_error: Option<Errno>,
    // files whose name ends with the suffix fail to be created
    make_file_error: Option<(String, Errno)>,
    metrics: Option<IncFsMetrics>,
    last_read_error: Option<ReadError>,
    existing: Vec<ExistingMount>,
    special_fd: Option<FileId>,
}

/// Storage primitive over plain directories. File ids and metadata are
/// tracked in memory.
pub struct FakeIncFs {
    state: Mutex<IncFsState>,
}

impl Default for FakeIncFs {
    fn default() -> Self {
        Self {
            state: Mutex::new(IncFsState {
                features: Features::V2,
                files: HashMap::new(),
                everything: LoadingState::MissingBlocks,
                pending_reads: Vec::new(),
                written: Vec::new(),
                reserved: Vec::new(),
                mapped: Vec::new(),
                uid_timeouts: Vec::new(),
                reserve_error: None,
                open_error: None,
                make_file_error: None,
                metrics: None,
                last_read_error: None,
                existing: Vec::new(),
                special_fd: None,
            }),
        }
    }
}

impl FakeIncFs {
    pub fn set_features(&self, features: Features) {
        lock(&self.state).features = features;
    }

    pub fn set_fully_loaded(&self, loaded: bool) {
        lock(&self.state).everything = if loaded {
            LoadingState::Full
        } else {
            LoadingState::MissingBlocks
        };
    }

    pub fn set_pending_reads(&self, reads: Vec<PendingRead>) {
        lock(&self.state).pending_reads = reads;
    }

    pub fn set_reserve_error(&self, error: Option<Errno>) {
        lock(&self.state).reserve_error = error;
    }

    pub fn fail_make_file(&self, suffix: &str, error: Option<Errno>) {
        lock(&self.state).make_file_error = error.map(|e| (suffix.to_string(), e));
    }

    pub fn set_open_error(&self, error: Option<Errno>) {
        lock(&self.state).open_error = error;
    }

    pub fn set_metrics(&self, metrics: Option<IncFsMetrics>) {
        lock(&self.state).metrics = metrics;
    }

    pub fn set_last_read_error(&self, error: Option<ReadError>) {
        lock(&self.state).last_read_error = error;
    }

    pub fn set_existing_mounts(&self, mounts: Vec<ExistingMount>) {
        lock(&self.state).existing = mounts;
    }

    /// Registers a file created outside the service, e.g. an archive.
    pub fn add_file(&self, path: &str, id: FileId, size: u64) {
        lock(&self.state).files.insert(
            path.to_string(),
            FakeFile {
                id,
                metadata: Vec::new(),
                size,
            },
        );
    }

    pub fn has_file(&self, path: &str) -> bool {
        lock(&self.state).files.contains_key(path)
    }

    pub fn metadata_of(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).map(|f| f.metadata.clone())
    }

    /// (file, block index, length) of every written block.
    pub fn written(&self) -> Vec<(FileId, u32, usize)> {
        lock(&self.state).written.clone()
    }

    pub fn reserved(&self) -> Vec<(FileId, Option<u64>)> {
        lock(&self.state).reserved.clone()
    }

    pub fn mapped(&self) -> Vec<String> {
        lock(&self.state).mapped.clone()
    }

    pub fn uid_timeouts(&self) -> Vec<Vec<PerUidReadTimeouts>> {
        lock(&self.state).uid_timeouts.clone()
    }

    fn blocks_of(state: &IncFsState, file: &FakeFile) -> (i64, i64) {
        let total = file.size.div_ceil(4096) as i64;
        let filled = match state.everything {
            LoadingState::Full => total,
            LoadingState::MissingBlocks => {
                let written: HashSet<u32> = state
                    .written
                    .iter()
                    .filter(|(id, _, _)| *id == file.id)
                    .map(|(_, block, _)| *block)
                    .collect();
                (written.len() as i64).min(total)
            }
        };
        (filled, total)
    }
}

impl IncFs for FakeIncFs {
    fn features(&self) -> Features {
        lock(&self.state).features
    }

    fn open_mount(&self, dir: &str) -> Option<Control> {
        Path::new(dir).is_dir().then(dev_null_control)
    }

    fn make_file(
        &self,
        _control: &Control,
        path: &str,
        _mode: u32,
        id: FileId,
        params: &NewFileParams,
    ) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if let Some((suffix, e)) = &state.make_file_error {
            if path.ends_with(suffix.as_str()) {
                return Err(*e);
            }
        }
        if Path::new(path).exists() {
            return Err(Errno::EEXIST);
        }
        fs::write(path, b"").map_err(|e| errno_of(&e))?;
        state.files.insert(
            path.to_string(),
            FakeFile {
                id,
                metadata: params.metadata.clone(),
                size: params.size.max(0) as u64,
            },
        );
        Ok(())
    }

    fn make_mapped_file(
        &self,
        _control: &Control,
        path: &str,
        _mode: u32,
        source: FileId,
        offset: u64,
        size: u64,
    ) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if !state.features.contains(Features::V2) {
            return Err(Errno::EOPNOTSUPP);
        }
        fs::write(path, b"").map_err(|e| errno_of(&e))?;
        let mut metadata = source.0.to_vec();
        metadata.extend_from_slice(&offset.to_le_bytes());
        state.files.insert(
            path.to_string(),
            FakeFile {
                id: FileId::from_metadata(&metadata),
                metadata,
                size,
            },
        );
        state.mapped.push(path.to_string());
        Ok(())
    }

    fn make_dir(&self, _control: &Control, path: &str, _mode: u32) -> Result<(), Errno> {
        fs::create_dir(path).map_err(|e| errno_of(&e))
    }

    fn make_dirs(&self, _control: &Control, path: &str, _mode: u32) -> Result<(), Errno> {
        fs::create_dir_all(path).map_err(|e| errno_of(&e))
    }

    fn get_metadata(&self, _control: &Control, id: FileId) -> Result<Vec<u8>, Errno> {
        lock(&self.state)
            .files
            .values()
            .find(|f| f.id == id)
            .map(|f| f.metadata.clone())
            .ok_or(Errno::ENOENT)
    }

    fn get_metadata_by_path(&self, _control: &Control, path: &str) -> Result<Vec<u8>, Errno> {
        lock(&self.state)
            .files
            .get(path)
            .map(|f| f.metadata.clone())
            .ok_or(Errno::ENOENT)
    }

    fn get_file_id(&self, _control: &Control, path: &str) -> Result<FileId, Errno> {
        lock(&self.state)
            .files
            .get(path)
            .map(|f| f.id)
            .ok_or(Errno::ENOENT)
    }

    fn count_filled_blocks(&self, _control: &Control, path: &str) -> Result<(i64, i64), Errno> {
        let state = lock(&self.state);
        let file = state.files.get(path).ok_or(Errno::EOPNOTSUPP)?;
        Ok(Self::blocks_of(&state, file))
    }

    fn is_file_fully_loaded(&self, control: &Control, path: &str) -> Result<LoadingState, Errno> {
        let (filled, total) = self.count_filled_blocks(control, path)?;
        Ok(if filled == total {
            LoadingState::Full
        } else {
            LoadingState::MissingBlocks
        })
    }

    fn is_file_fully_loaded_by_id(
        &self,
        _control: &Control,
        id: FileId,
    ) -> Result<LoadingState, Errno> {
        let state = lock(&self.state);
        let file = state
            .files
            .values()
            .find(|f| f.id == id)
            .ok_or(Errno::ENOENT)?;
        let (filled, total) = Self::blocks_of(&state, file);
        Ok(if filled == total {
            LoadingState::Full
        } else {
            LoadingState::MissingBlocks
        })
    }

    fn is_everything_fully_loaded(&self, _control: &Control) -> Result<LoadingState, Errno> {
        Ok(lock(&self.state).everything)
    }

    fn link(&self, _control: &Control, from: &str, to: &str) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        fs::hard_link(from, to).map_err(|e| errno_of(&e))?;
        if let Some(file) = state.files.get(from).cloned() {
            state.files.insert(to.to_string(), file);
        }
        Ok(())
    }

    fn unlink(&self, _control: &Control, path: &str) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        let removed = if Path::new(path).is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        removed.map_err(|e| errno_of(&e))?;
        state.files.remove(path);
        Ok(())
    }

    fn open_for_special_ops(&self, _control: &Control, id: FileId) -> Result<OwnedFd, Errno> {
        let mut state = lock(&self.state);
        if let Some(e) = state.open_error {
            return Err(e);
        }
        if !state.files.values().any(|f| f.id == id) {
            return Err(Errno::ENOENT);
        }
        state.special_fd = Some(id);
        File::open("/dev/null")
            .map(OwnedFd::from)
            .map_err(|e| errno_of(&e))
    }

    fn write_blocks(&self, blocks: &[DataBlock<'_>]) -> Result<usize, Errno> {
        let mut state = lock(&self.state);
        let id = state.special_fd.ok_or(Errno::EBADF)?;
        for block in blocks {
            state.written.push((id, block.page_index, block.data.len()));
        }
        Ok(blocks.len())
    }

    fn reserve_space(
        &self,
        _control: &Control,
        id: FileId,
        size: Option<u64>,
    ) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if let Some(e) = state.reserve_error {
            return Err(e);
        }
        state.reserved.push((id, size));
        Ok(())
    }

    fn wait_for_pending_reads(
        &self,
        _control: &Control,
        _timeout: Duration,
        reads: &mut Vec<PendingRead>,
    ) -> WaitResult {
        let state = lock(&self.state);
        if state.pending_reads.is_empty() {
            return WaitResult::Timeout;
        }
        reads.clone_from(&state.pending_reads);
        WaitResult::HaveData
    }

    fn set_uid_read_timeouts(
        &self,
        _control: &Control,
        timeouts: &[PerUidReadTimeouts],
    ) -> Result<(), Errno> {
        lock(&self.state).uid_timeouts.push(timeouts.to_vec());
        Ok(())
    }

    fn for_each_file(
        &self,
        _control: &Control,
        f: &mut dyn FnMut(FileId) -> bool,
    ) -> Result<(), Errno> {
        let ids: Vec<FileId> = lock(&self.state).files.values().map(|f| f.id).collect();
        for id in ids {
            if !f(id) {
                break;
            }
        }
        Ok(())
    }

    fn get_metrics(&self, _metrics_key: &str) -> Option<IncFsMetrics> {
        lock(&self.state).metrics
    }

    fn get_last_read_error(&self, _control: &Control) -> Option<ReadError> {
        lock(&self.state).last_read_error
    }

    fn list_existing_mounts(&self) -> Vec<ExistingMount> {
        lock(&self.state).existing.clone()
    }
}

#[derive(Default)]
struct ManagerState {
    listeners: HashMap<MountId, Arc<dyn DataLoaderStatusListener>>,
    binds: Vec<(MountId, Duration)>,
    creates: usize,
    starts: usize,
    unbinds: usize,
    fail_bind: bool,
}

/// Loader manager whose loaders answer every request synchronously.
#[derive(Default)]
pub struct FakeDataLoaderManager {
    state: Arc<Mutex<ManagerState>>,
}

impl FakeDataLoaderManager {
    pub fn fail_bind(&self, fail: bool) {
        lock(&self.state).fail_bind = fail;
    }

    pub fn binds(&self) -> Vec<(MountId, Duration)> {
        lock(&self.state).binds.clone()
    }

    pub fn creates(&self) -> usize {
        lock(&self.state).creates
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn unbinds(&self) -> usize {
        lock(&self.state).unbinds
    }

    /// Reports `status` for `id` as the remote side would.
    pub fn report(&self, id: MountId, status: DataLoaderStatus) {
        let listener = lock(&self.state).listeners.get(&id).cloned();
        if let Some(listener) = listener {
            listener.on_status_changed(id, status);
        }
    }
}

impl DataLoaderManager for FakeDataLoaderManager {
    fn bind_to_data_loader(
        &self,
        id: MountId,
        _params: &DataLoaderParams,
        bind_delay: Duration,
        listener: Arc<dyn DataLoaderStatusListener>,
    ) -> Result<(), Errno> {
        {
            let mut state = lock(&self.state);
            state.binds.push((id, bind_delay));
            if state.fail_bind {
                return Err(Errno::ECONNREFUSED);
            }
            state.listeners.insert(id, listener);
        }
        self.report(id, DataLoaderStatus::Bound);
        Ok(())
    }

    fn get_data_loader(&self, id: MountId) -> Option<Arc<dyn DataLoader>> {
        let listener = lock(&self.state).listeners.get(&id).cloned()?;
        Some(Arc::new(FakeDataLoader {
            state: self.state.clone(),
            listener,
        }))
    }

    fn unbind_from_data_loader(&self, id: MountId) -> Result<(), Errno> {
        let listener = {
            let mut state = lock(&self.state);
            state.unbinds += 1;
            state.listeners.remove(&id)
        };
        if let Some(listener) = listener {
            listener.on_status_changed(id, DataLoaderStatus::Destroyed);
        }
        Ok(())
    }
}

/// Loader handed out by [`FakeDataLoaderManager`].
struct FakeDataLoader {
    state: Arc<Mutex<ManagerState>>,
    listener: Arc<dyn DataLoaderStatusListener>,
}

impl DataLoader for FakeDataLoader {
    fn create(
        &self,
        id: MountId,
        _params: &DataLoaderParams,
        _control: FileSystemControl,
        _listener: Arc<dyn DataLoaderStatusListener>,
    ) -> Result<(), Errno> {
        lock(&self.state).creates += 1;
        self.listener.on_status_changed(id, DataLoaderStatus::Created);
        Ok(())
    }

    fn start(&self, id: MountId) -> Result<(), Errno> {
        lock(&self.state).starts += 1;
        self.listener.on_status_changed(id, DataLoaderStatus::Started);
        Ok(())
    }
}

/// Looper whose callbacks run only when a test fires them.
#[derive(Default)]
pub struct FakeLooper {
    callbacks: Mutex<HashMap<RawFd, LooperCallback>>,
}

impl FakeLooper {
    pub fn registered(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Runs every registered callback once.
    pub fn fire_all(&self) -> usize {
        let fds: Vec<RawFd> = lock(&self.callbacks).keys().copied().collect();
        let mut fired = 0;
        for fd in fds {
            let Some(mut callback) = lock(&self.callbacks).remove(&fd) else {
                continue;
            };
            fired += 1;
            if callback(fd) {
                lock(&self.callbacks).entry(fd).or_insert(callback);
            }
        }
        fired
    }
}

impl Looper for FakeLooper {
    fn add_fd(&self, fd: RawFd, callback: LooperCallback) {
        lock(&self.callbacks).insert(fd, callback);
    }

    fn remove_fd(&self, fd: RawFd) -> bool {
        lock(&self.callbacks).remove(&fd).is_some()
    }

    fn wake(&self) {}

    fn poll_all(&self, _timeout: Option<Duration>) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(10));
        Ok(0)
    }
}

pub struct FakeArchive {
    entries: Vec<(ArchiveEntry, Vec<u8>)>,
}

impl FakeArchive {
    pub fn new(entries: Vec<(ArchiveEntry, Vec<u8>)>) -> Self {
        Self { entries }
    }
}

impl Archive for FakeArchive {
    fn entries(&self, prefix: &str, suffix: &str) -> Vec<ArchiveEntry> {
        self.entries
            .iter()
            .map(|(entry, _)| entry)
            .filter(|e| e.name.starts_with(prefix) && e.name.ends_with(suffix))
            .cloned()
            .collect()
    }

    fn extract(&self, entry: &ArchiveEntry) -> io::Result<Vec<u8>> {
        self.entries
            .iter()
            .find(|(e, _)| e.name == entry.name)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

#[derive(Default)]
pub struct FakeArchiveReader {
    archives: Mutex<HashMap<String, Arc<FakeArchive>>>,
}

impl FakeArchiveReader {
    pub fn insert(&self, path: &str, archive: FakeArchive) {
        lock(&self.archives).insert(path.to_string(), Arc::new(archive));
    }
}

impl ArchiveReader for FakeArchiveReader {
    fn open(&self, path: &str) -> io::Result<Arc<dyn Archive>> {
        lock(&self.archives)
            .get(path)
            .cloned()
            .map(|a| a as Arc<dyn Archive>)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// Fakes wired together over one temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub root: String,
    pub clock: Arc<FakeClock>,
    pub timed_queue: Arc<ManualTimedQueue>,
    pub progress_queue: Arc<ManualTimedQueue>,
    pub mounter: Arc<FakeMounter>,
    pub incfs: Arc<FakeIncFs>,
    pub manager: Arc<FakeDataLoaderManager>,
    pub looper: Arc<FakeLooper>,
    pub archives: Arc<FakeArchiveReader>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("incremental");
        fs::create_dir(&root).unwrap();
        let clock = Arc::new(FakeClock::new());
        Self {
            root: root.to_str().unwrap().to_string(),
            dir,
            timed_queue: Arc::new(ManualTimedQueue::new(clock.clone())),
            progress_queue: Arc::new(ManualTimedQueue::new(clock.clone())),
            clock,
            mounter: Arc::default(),
            incfs: Arc::default(),
            manager: Arc::default(),
            looper: Arc::default(),
            archives: Arc::default(),
        }
    }

    /// Creates an empty directory to mount or bind onto.
    pub fn target(&self, name: &str) -> String {
        let target = self.dir.path().join("targets").join(name);
        fs::create_dir_all(&target).unwrap();
        target.to_str().unwrap().to_string()
    }

    pub fn deps(&self, app_ops: MockAppOps) -> ServiceDeps {
        ServiceDeps {
            mounter: self.mounter.clone(),
            data_loader_manager: self.manager.clone(),
            incfs: self.incfs.clone(),
            app_ops: Arc::new(app_ops),
            clock: self.clock.clone(),
            fs: Arc::new(WalkDirFs),
            looper: self.looper.clone(),
            timed_queue: self.timed_queue.clone(),
            progress_queue: self.progress_queue.clone(),
            archive_reader: self.archives.clone(),
        }
    }

    pub fn start(&self) -> Arc<IncrementalService> {
        self.start_with(ServiceConfig::default(), MockAppOps::new())
    }

    pub fn start_with(
        &self,
        config: ServiceConfig,
        app_ops: MockAppOps,
    ) -> Arc<IncrementalService> {
        IncrementalService::new(&self.root, config, self.deps(app_ops)).unwrap()
    }

    /// Names under the incremental root dir.
    pub fn root_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
