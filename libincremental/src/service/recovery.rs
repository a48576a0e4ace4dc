//! Rebuilding mounts left behind by a previous service instance.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use scopeguard::ScopeGuard;
use tracing::{error, info, warn};

use super::IncrementalService;
use super::storage::{add_bind_record_locked, make_unique_name};
use crate::constants::{
    BACKING_DIR, INFO_RECORD_NAME, MOUNT_DIR, MOUNT_KEY_PREFIX, MOUNTPOINT_RECORD_PREFIX,
    READ_LOGS_DISABLED_MARKER, STORAGE_PREFIX,
};
use crate::incfs::ExistingMount;
use crate::mount::{IncFsMount, Storage};
use crate::path;
use crate::records::{self, BindRecord, MountRecord};
use crate::types::{BindKind, HealthCheckParams, StorageId};

/// Storage id encoded in a `st_<id>_<n>` directory name.
fn parse_storage_id(name: &str) -> Option<StorageId> {
    let rest = name.strip_prefix(STORAGE_PREFIX)?.strip_prefix('_')?;
    let (id, _) = rest.split_once('_')?;
    id.parse().ok()
}

struct MountContents {
    storages: Vec<(StorageId, String)>,
    /// (record file name, record)
    binds: Vec<(String, BindRecord)>,
}

impl IncrementalService {
    /// Takes over mounts that are still mounted. Returns the names of the
    /// adopted mount dirs.
    pub(super) fn adopt_mounted_instances(&self) -> HashSet<String> {
        let mut adopted = HashSet::new();
        for existing in self.deps.incfs.list_existing_mounts() {
            if let Some(name) = self.adopt_mount(existing) {
                adopted.insert(name);
            }
        }
        adopted
    }

    fn adopt_mount(&self, existing: ExistingMount) -> Option<String> {
        let mount_dir = existing.root.as_str();
        let expected_root = path::dirname(mount_dir);
        if path::basename(mount_dir) != MOUNT_DIR
            || path::basename(&existing.backing_dir) != BACKING_DIR
            || path::dirname(&existing.backing_dir) != expected_root
            || path::dirname(expected_root) != self.root
            || !path::basename(expected_root).starts_with(MOUNT_KEY_PREFIX)
        {
            info!("skipping mount {mount_dir} with unknown layout");
            return None;
        }
        info!("adopting mount {mount_dir}");

        let files_guard = scopeguard::guard(expected_root.to_string(), |root| {
            IncFsMount::cleanup_filesystem(&root);
        });
        let mounter = self.deps.mounter.clone();
        let mounts_guard = scopeguard::guard(
            (existing.binds.clone(), mount_dir.to_string()),
            move |(binds, mount_dir)| {
                for (_, target) in binds {
                    if let Err(e) = mounter.unmount_incfs(&target) {
                        warn!("failed to unmount {target}: {e}");
                    }
                }
                if let Err(e) = mounter.unmount_incfs(&mount_dir) {
                    warn!("failed to unmount {mount_dir}: {e}");
                }
            },
        );

        let Some(control) = self.deps.incfs.open_mount(mount_dir) else {
            error!("failed to open existing mount {mount_dir}");
            return None;
        };
        let record: MountRecord = records::read(
            self.deps.incfs.as_ref(),
            &control,
            &path::join(mount_dir, INFO_RECORD_NAME),
        )?;
        let mount_id = record.storage_id;
        self.registry().observe_id(mount_id);

        let ifs = Arc::new(IncFsMount::new(
            mount_id,
            ScopeGuard::into_inner(files_guard),
            String::new(),
            control,
            self.deps.mounter.clone(),
        ));
        if Path::new(&path::join(mount_dir, READ_LOGS_DISABLED_MARKER)).exists() {
            ifs.lock().disallow_read_logs();
        }

        let contents = self.scan_mount(&ifs)?;
        if contents.storages.is_empty() {
            warn!("no valid storages in mount {mount_dir}");
            return None;
        }
        {
            let mut state = ifs.lock();
            for (id, name) in contents.storages {
                state.storages.insert(id, Storage { name });
            }
        }

        let mut live_binds = existing.binds.clone();
        for (saved_filename, record) in contents.binds {
            let matched = live_binds.iter().position(|(source, target)| {
                *target == record.dest_path && path::join(mount_dir, source) == record.source_subdir
            });
            match matched {
                Some(pos) => {
                    live_binds.swap_remove(pos);
                    let mut registry = self.registry();
                    let mut state = ifs.lock();
                    add_bind_record_locked(
                        &mut registry,
                        mount_id,
                        &mut state,
                        record.storage_id,
                        saved_filename,
                        record.source_subdir,
                        record.dest_path,
                        BindKind::Permanent,
                    );
                }
                None => {
                    let record_path = path::join(mount_dir, &saved_filename);
                    if let Err(e) = self.add_bind_mount_with_md(
                        &ifs,
                        record.storage_id,
                        saved_filename,
                        record.source_subdir,
                        record.dest_path,
                        BindKind::Permanent,
                        None,
                    ) {
                        warn!("dropping bind record {record_path}: {e}");
                        if let Err(e) = self.deps.incfs.unlink(ifs.control(), &record_path) {
                            warn!("failed to remove {record_path}: {e}");
                        }
                    }
                }
            }
        }

        for (_, target) in &live_binds {
            info!("unmounting stray bind {target}");
            if let Err(e) = self.deps.mounter.unmount_incfs(target) {
                warn!("failed to unmount {target}: {e}");
            }
        }
        ScopeGuard::into_inner(mounts_guard);

        let state = ifs.lock();
        if state.bind_points.is_empty() {
            warn!("no valid bind points for mount {mount_dir}");
            self.delete_storage_locked(&ifs, state);
            return None;
        }
        drop(state);

        self.finish_recovery(&ifs, record);
        Some(path::basename(ifs.root()).to_string())
    }

    /// Mounts the images under the root dir that nothing had mounted.
    pub(super) fn mount_existing_images(&self, adopted: &HashSet<String>) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to list {}: {e}", self.root);
                return;
            }
        };
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(MOUNT_KEY_PREFIX) || adopted.contains(&name) {
                continue;
            }
            let root = path::join(&self.root, &name);
            info!("mounting existing image {root}");
            if !self.mount_existing_image(&root) {
                IncFsMount::cleanup_filesystem(&root);
            }
        }
    }

    fn mount_existing_image(&self, root: &str) -> bool {
        let mount_dir = path::join(root, MOUNT_DIR);
        let backing = path::join(root, BACKING_DIR);
        let metrics_key = make_unique_name(path::basename(root));
        let control = {
            let _lock = self.mount_op_lock();
            match self
                .deps
                .mounter
                .mount_incfs(&backing, &mount_dir, &metrics_key)
            {
                Ok(control) => control,
                Err(e) => {
                    error!("mount_incfs of {root} failed: {e}");
                    return false;
                }
            }
        };

        let Some(record) = records::read::<MountRecord>(
            self.deps.incfs.as_ref(),
            &control,
            &path::join(&mount_dir, INFO_RECORD_NAME),
        ) else {
            error!("bad mount record in {root}");
            if let Err(e) = self.deps.mounter.unmount_incfs(&mount_dir) {
                warn!("failed to unmount {mount_dir}: {e}");
            }
            return false;
        };
        let mount_id = record.storage_id;
        self.registry().observe_id(mount_id);

        let ifs = Arc::new(IncFsMount::new(
            mount_id,
            root.to_string(),
            metrics_key,
            control,
            self.deps.mounter.clone(),
        ));
        if Path::new(&path::join(&mount_dir, READ_LOGS_DISABLED_MARKER)).exists() {
            ifs.lock().disallow_read_logs();
        }

        let Some(contents) = self.scan_mount(&ifs) else {
            return false;
        };
        if contents.storages.is_empty() {
            warn!("no valid storages in mount {root}");
            return false;
        }
        {
            let mut state = ifs.lock();
            for (id, name) in contents.storages {
                state.storages.insert(id, Storage { name });
            }
        }

        let mut bind_count = 0;
        for (saved_filename, record) in contents.binds {
            match self.add_bind_mount_with_md(
                &ifs,
                record.storage_id,
                saved_filename,
                record.source_subdir,
                record.dest_path,
                BindKind::Permanent,
                None,
            ) {
                Ok(()) => bind_count += 1,
                Err(e) => warn!("failed to restore bind of mount {root}: {e}"),
            }
        }
        if bind_count == 0 {
            warn!("no valid bind points for mount {root}");
            let state = ifs.lock();
            self.delete_storage_locked(&ifs, state);
            return false;
        }

        self.finish_recovery(&ifs, record);
        true
    }

    /// Reads the storages and bind records of a mount. Unusable bind records
    /// are removed.
    fn scan_mount(&self, ifs: &IncFsMount) -> Option<MountContents> {
        let mount_dir = ifs.mount_dir();
        let entries = match fs::read_dir(&mount_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to read mount dir {mount_dir}: {e}");
                return None;
            }
        };

        let mut contents = MountContents {
            storages: Vec::new(),
            binds: Vec::new(),
        };
        let mut seen = HashSet::new();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let full_path = path::join(&mount_dir, &name);

            if file_type.is_file() {
                if !name.starts_with(MOUNTPOINT_RECORD_PREFIX) {
                    continue;
                }
                match records::read::<BindRecord>(
                    self.deps.incfs.as_ref(),
                    ifs.control(),
                    &full_path,
                ) {
                    Some(record) if record.is_complete() => {
                        info!(
                            "permanent bind record: '{}' -> '{}'",
                            record.source_subdir, record.dest_path
                        );
                        contents.binds.push((name, record));
                    }
                    _ => {
                        warn!("removing unusable bind record {full_path}");
                        if let Err(e) = self.deps.incfs.unlink(ifs.control(), &full_path) {
                            warn!("failed to remove {full_path}: {e}");
                        }
                    }
                }
                continue;
            }

            if !file_type.is_dir() || !name.starts_with(STORAGE_PREFIX) {
                continue;
            }
            let Some(id) = parse_storage_id(&name) else {
                warn!("ignoring storage with invalid name '{name}' in {mount_dir}");
                continue;
            };
            if !seen.insert(id) || self.registry().contains(id) {
                warn!("ignoring storage with duplicate id {id} in {mount_dir}");
                continue;
            }
            self.registry().observe_id(id);
            contents.storages.push((id, full_path));
        }
        Some(contents)
    }

    /// Sets up the loader of a recovered mount and publishes its storages.
    fn finish_recovery(&self, ifs: &Arc<IncFsMount>, record: MountRecord) {
        let storage_ids: Vec<StorageId> = {
            let mut state = ifs.lock();
            if let Err(e) = self.prepare_data_loader_locked(
                ifs,
                &mut state,
                record.loader,
                None,
                HealthCheckParams::default(),
                None,
            ) {
                warn!("failed to prepare data loader of mount {}: {e}", ifs.id());
            }
            state.storages.keys().copied().collect()
        };

        let mut registry = self.registry();
        for id in storage_ids.into_iter().chain([ifs.id()]) {
            if !registry.insert(id, ifs.clone()) {
                warn!("storage id {id} of mount {} is taken", ifs.id());
            }
        }
        info!("recovered mount {} at {}", ifs.id(), ifs.root());
    }
}
