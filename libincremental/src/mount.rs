//! One backing incremental filesystem image and the storages inside it.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::errno::Errno;
use tracing::{debug, error, info, warn};

use crate::constants::{BACKING_DIR, MAX_STORAGE_DIR_ATTEMPTS, MOUNT_DIR, STORAGE_PREFIX};
use crate::control::Control;
use crate::data_loader::DataLoaderStub;
use crate::incfs::IncFs;
use crate::mounter::MountService;
use crate::path::{self, PathKey};
use crate::types::{BindKind, MountId, StorageId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StorageFlags: u32 {
        const READ_LOGS_ALLOWED = 1;
        const READ_LOGS_ENABLED = 1 << 1;
        const READ_LOGS_REQUESTED = 1 << 2;
        const READ_TIMEOUTS_ENABLED = 1 << 3;
        const READ_TIMEOUTS_REQUESTED = 1 << 4;
    }
}

/// When the current installation asked its loader to start streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadingStart {
    #[default]
    NotStarted,
    /// Read logs may be collected without a time limit.
    Unlimited,
    At(Instant),
}

impl LoadingStart {
    /// Whether the read-log window of `max` has closed at `now`.
    pub fn window_closed(&self, now: Instant, max: Duration) -> bool {
        match self {
            // never started counts as started long ago
            LoadingStart::NotStarted => true,
            LoadingStart::Unlimited => false,
            LoadingStart::At(ts) => *ts <= now && now.duration_since(*ts) > max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    /// Absolute path of the storage root inside the mount.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub storage: StorageId,
    /// Record file name for permanent binds, empty for temporary ones.
    pub saved_filename: String,
    pub source_dir: String,
    pub kind: BindKind,
}

pub struct MountState {
    pub storages: BTreeMap<StorageId, Storage>,
    pub bind_points: BTreeMap<PathKey, Bind>,
    pub stub: Option<Arc<DataLoaderStub>>,
    pub flags: StorageFlags,
    pub loading_start: LoadingStart,
}

impl MountState {
    pub fn has(&self, flag: StorageFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set(&mut self, flag: StorageFlags, value: bool) {
        self.flags.set(flag, value);
    }

    pub fn read_logs_allowed(&self) -> bool {
        self.has(StorageFlags::READ_LOGS_ALLOWED)
    }

    pub fn read_logs_enabled(&self) -> bool {
        self.has(StorageFlags::READ_LOGS_ENABLED)
    }

    /// Forbids read logs for good; already enabled ones stay until disabled.
    pub fn disallow_read_logs(&mut self) {
        self.set(StorageFlags::READ_LOGS_ALLOWED, false);
    }
}

pub struct IncFsMount {
    id: MountId,
    root: String,
    metrics_key: String,
    control: Control,
    state: Mutex<MountState>,
    next_storage_dir_no: AtomicI32,
    mounter: Arc<dyn MountService>,
}

impl IncFsMount {
    pub fn new(
        id: MountId,
        root: String,
        metrics_key: String,
        control: Control,
        mounter: Arc<dyn MountService>,
    ) -> Self {
        Self {
            id,
            root,
            metrics_key,
            control,
            state: Mutex::new(MountState {
                storages: BTreeMap::new(),
                bind_points: BTreeMap::new(),
                stub: None,
                flags: StorageFlags::READ_LOGS_ALLOWED,
                loading_start: LoadingStart::NotStarted,
            }),
            next_storage_dir_no: AtomicI32::new(0),
            mounter,
        }
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/mount`, where the filesystem itself is mounted.
    pub fn mount_dir(&self) -> String {
        path::join(&self.root, MOUNT_DIR)
    }

    pub fn metrics_key(&self) -> &str {
        &self.metrics_key
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn lock(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_storage_dir_no(&self) -> i32 {
        self.next_storage_dir_no.load(Ordering::Relaxed)
    }

    /// Creates the directory of a new storage `id` and records it. Returns
    /// the storage root path.
    pub fn make_storage(&self, incfs: &dyn IncFs, id: StorageId) -> Result<String, Errno> {
        let mut result = Err(Errno::EEXIST);
        for _ in 0..MAX_STORAGE_DIR_ATTEMPTS {
            let no = self.next_storage_dir_no.fetch_add(1, Ordering::Relaxed);
            if no < 0 {
                break;
            }
            let name = path::join(&self.mount_dir(), &format!("{STORAGE_PREFIX}_{id}_{no}"));
            match incfs.make_dir(&self.control, &name, 0o755) {
                Ok(()) => {
                    self.lock().storages.insert(id, Storage { name: name.clone() });
                    return Ok(name);
                }
                Err(Errno::EEXIST) => continue,
                Err(e) => {
                    error!("failed to create storage dir {name}: {e}");
                    result = Err(e);
                    break;
                }
            }
        }
        self.next_storage_dir_no.store(0, Ordering::Relaxed);
        result
    }

    /// Removes what a mount leaves on disk once nothing is mounted over it.
    pub fn cleanup_filesystem(root: &str) {
        let backing = path::join(root, BACKING_DIR);
        if let Err(e) = fs::remove_dir_all(&backing) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to delete {backing}: {e}");
            }
        }
        for dir in [path::join(root, MOUNT_DIR), root.to_string()] {
            if let Err(e) = fs::remove_dir(&dir) {
                debug!("failed to rmdir {dir}: {e}");
            }
        }
    }
}

impl Drop for IncFsMount {
    fn drop(&mut self) {
        let (stub, targets) = {
            let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
            let targets: Vec<PathKey> = state.bind_points.keys().cloned().collect();
            (state.stub.take(), targets)
        };
        if let Some(stub) = stub {
            stub.cleanup_resources();
        }
        info!(
            "unmounting and cleaning up mount {} with root '{}'",
            self.id, self.root
        );
        for target in targets {
            info!("  bind: {target}");
            if let Err(e) = self.mounter.unmount_incfs(target.as_str()) {
                warn!("failed to unmount {target}: {e}");
            }
        }
        let mount_dir = self.mount_dir();
        info!("  root: {}", self.root);
        if let Err(e) = self.mounter.unmount_incfs(&mount_dir) {
            warn!("failed to unmount {mount_dir}: {e}");
        }
        Self::cleanup_filesystem(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_log_window() {
        let start = Instant::now();
        let max = Duration::from_secs(10);
        let at = LoadingStart::At(start);
        assert!(!at.window_closed(start + Duration::from_secs(10), max));
        assert!(at.window_closed(start + Duration::from_secs(11), max));
        assert!(!LoadingStart::Unlimited.window_closed(start + Duration::from_secs(1000), max));
        assert!(LoadingStart::NotStarted.window_closed(start, max));
    }

    #[test]
    fn cleanup_removes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("MT_data_app");
        fs::create_dir_all(root.join("backing_store/.index")).unwrap();
        fs::write(root.join("backing_store/.index/blob"), b"x").unwrap();
        fs::create_dir_all(root.join("mount")).unwrap();

        IncFsMount::cleanup_filesystem(root.to_str().unwrap());
        assert!(!root.exists());
        // nothing left to remove is fine
        IncFsMount::cleanup_filesystem(root.to_str().unwrap());
    }
}
