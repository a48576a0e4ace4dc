//! Storage creation, bind points and path resolution.

use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::mem;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::sync::{Arc, MutexGuard};

use scopeguard::ScopeGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::IncrementalService;
use crate::constants::{
    BACKING_DIR, INCOMPLETE_DIR, INDEX_DIR, INFO_RECORD_NAME, MAX_MOUNT_DIR_ATTEMPTS,
    MAX_MOUNT_KEY_LEN, MOUNT_DIR, MOUNT_KEY_PREFIX, MOUNTPOINT_RECORD_PREFIX,
};
use crate::error::{IncrementalError, Result};
use crate::mount::{Bind, IncFsMount, MountState};
use crate::path::{self, PathKey};
use crate::records::{self, BindRecord, MountRecord};
use crate::registry::{BindRef, Registry};
use crate::types::{
    BindKind, CreateOptions, DataLoaderParams, FileId, MountId, NewFileParams, StorageId,
};

/// Creates `path` with `mode`. An existing directory is accepted when
/// `allow_existing` is set.
pub(super) fn mkdir_or_log(path: &str, mode: u32, allow_existing: bool) -> bool {
    if let Err(e) = DirBuilder::new().mode(mode).create(path) {
        if !allow_existing || e.kind() != ErrorKind::AlreadyExists {
            error!("can't create directory '{path}': {e}");
            return false;
        }
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                error!("path exists but is not a directory: '{path}'");
                return false;
            }
        }
    }
    // mkdir is subject to the umask
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        error!("changing permission failed for '{path}': {e}");
        return false;
    }
    true
}

fn remove_dir_content(dir: &str) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Mount dir name derived from the bound path, e.g. `MT_data_app_x`.
pub(super) fn to_mount_key(path: &str) -> String {
    let key = match path {
        "" => "@none".to_string(),
        "/" => "@root".to_string(),
        _ => {
            let relative = path.strip_prefix('/').unwrap_or(path);
            let cut = relative
                .char_indices()
                .nth(MAX_MOUNT_KEY_LEN)
                .map_or(relative.len(), |(pos, _)| pos);
            relative[..cut].replace(['/', '@'], "_")
        }
    };
    format!("{MOUNT_KEY_PREFIX}{key}")
}

pub(super) fn make_unique_name(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4())
}

/// Creates a fresh mount root under `incremental_dir`. Returns the mount key
/// and the root path.
fn make_mount_dir(incremental_dir: &str, path: &str) -> Option<(String, String)> {
    let prefix = to_mount_key(path);
    for counter in 0..MAX_MOUNT_DIR_ATTEMPTS {
        let key = match counter {
            0 => prefix.clone(),
            n => format!("{prefix}{}", n - 1),
        };
        let root = path::join(incremental_dir, &key);
        if mkdir_or_log(&root, 0o777, false) {
            return Some((key, root));
        }
    }
    None
}

fn bind_kind(options: CreateOptions) -> BindKind {
    if options.contains(CreateOptions::PERMANENT_BIND) {
        BindKind::Permanent
    } else {
        BindKind::Temporary
    }
}

/// Translates `path` into a path inside the mount. Relative paths are taken
/// from `storage_root`; absolute ones must be under it or under one of the
/// mount's bind points.
pub(super) fn normalize_path_to_storage_locked(
    state: &MountState,
    storage_root: &str,
    path: &str,
) -> Option<String> {
    if !path::is_absolute(path) {
        return Some(path::normalize(&path::join(storage_root, path)));
    }
    let norm = path::normalize(path);
    if path::starts_with(&norm, storage_root) {
        return Some(norm);
    }
    let (target, bind) = path::find_parent(&state.bind_points, &norm)?;
    let rest = path::relativize(target.as_str(), &norm)?;
    Some(path::join(&bind.source_dir, rest))
}

/// Records a bind in both the mount and the global index.
#[allow(clippy::too_many_arguments)]
pub(super) fn add_bind_record_locked(
    registry: &mut Registry,
    mount: MountId,
    state: &mut MountState,
    storage: StorageId,
    saved_filename: String,
    source: String,
    target: String,
    kind: BindKind,
) {
    registry.add_bind(&target, BindRef { mount, storage });
    state.bind_points.insert(
        PathKey::new(target),
        Bind {
            storage,
            saved_filename,
            source_dir: source,
            kind,
        },
    );
}

impl IncrementalService {
    pub fn create_storage(
        &self,
        mount_point: &str,
        params: DataLoaderParams,
        options: CreateOptions,
    ) -> Result<StorageId> {
        info!("create_storage: {mount_point} | {options:?}");
        if !path::is_absolute(mount_point) {
            error!("path is not absolute: {mount_point}");
            return Err(IncrementalError::NotAbsolute(mount_point.to_string()));
        }

        let mount_norm = path::normalize(mount_point);
        if let Some(id) = self.find_storage_id(&mount_norm) {
            if options.contains(CreateOptions::OPEN_EXISTING) {
                info!("opened existing storage {id}");
                return Ok(id);
            }
            error!("directory {mount_point} is already mounted at storage {id}");
            return Err(IncrementalError::AlreadyBound(mount_norm));
        }

        if !options.contains(CreateOptions::CREATE_NEW) {
            error!("no storage at {mount_point} and creating a new one was not requested");
            return Err(IncrementalError::NotRequested(mount_norm));
        }

        if !matches!(path::is_empty_dir(&mount_norm), Ok(true)) {
            error!("mounting over a missing or non-empty directory is not supported: {mount_norm}");
            return Err(IncrementalError::InvalidMountTarget(mount_norm));
        }

        let Some((mount_key, mount_root)) = make_mount_dir(&self.root, &mount_norm) else {
            error!("bad mount point {mount_norm}");
            return Err(IncrementalError::InvalidMountTarget(mount_norm));
        };
        // removes everything created below while the mount object does not exist yet
        let first_cleanup = scopeguard::guard(mount_root, |root| {
            IncFsMount::cleanup_filesystem(&root);
        });

        let mount_target = path::join(&first_cleanup, MOUNT_DIR);
        let backing = path::join(&first_cleanup, BACKING_DIR);
        if !mkdir_or_log(&backing, 0o777, true) || !mkdir_or_log(&mount_target, 0o770, true) {
            return Err(IncrementalError::InvalidMountTarget(mount_norm));
        }

        let (metrics_key, control) = {
            let _lock = self.mount_op_lock();
            remove_dir_content(&backing)?;
            for dir in [INDEX_DIR, INCOMPLETE_DIR] {
                if !mkdir_or_log(&path::join(&backing, dir), 0o777, true) {
                    return Err(IncrementalError::InvalidMountTarget(backing));
                }
            }
            let metrics_key = make_unique_name(&mount_key);
            let control = self
                .deps
                .mounter
                .mount_incfs(&backing, &mount_target, &metrics_key)
                .map_err(|e| {
                    error!("mount_incfs failed: {e}");
                    IncrementalError::sys("mount_incfs", e)
                })?;
            (metrics_key, control)
        };

        let mount_id = self.registry().allocate_id();
        let mount_root = ScopeGuard::into_inner(first_cleanup);
        let ifs = Arc::new(IncFsMount::new(
            mount_id,
            mount_root,
            metrics_key,
            control,
            self.deps.mounter.clone(),
        ));
        // from here on the mount cleans up after itself, only the slot is left
        let second_cleanup = scopeguard::guard((), |_| self.registry().release(mount_id));

        let storage_root = ifs
            .make_storage(self.deps.incfs.as_ref(), mount_id)
            .map_err(|e| {
                error!("can't create a default storage directory: {e}");
                IncrementalError::sys("make_storage", e)
            })?;

        let record = records::encode(&MountRecord {
            storage_id: mount_id,
            loader: params,
        })?;
        self.deps
            .incfs
            .make_file(
                ifs.control(),
                &path::join(&ifs.mount_dir(), INFO_RECORD_NAME),
                0o777,
                FileId::from_metadata(&record),
                &NewFileParams {
                    size: 0,
                    metadata: record,
                    signature: Vec::new(),
                },
            )
            .map_err(|e| {
                error!("saving mount record failed: {e}");
                IncrementalError::sys("save mount record", e)
            })?;

        self.add_bind_mount(
            &ifs,
            mount_id,
            storage_root.clone(),
            mount_norm,
            bind_kind(options),
            Some(mount_id),
        )
        .inspect_err(|e| error!("adding bind mount failed: {e}"))?;

        ScopeGuard::into_inner(second_cleanup);
        info!("created storage {mount_id}");
        Ok(mount_id)
    }

    pub fn create_linked_storage(
        &self,
        mount_point: &str,
        linked_storage: StorageId,
        options: CreateOptions,
    ) -> Result<StorageId> {
        if !path::is_valid_mount_target(mount_point) {
            error!("mount point {mount_point} is invalid or missing");
            return Err(IncrementalError::InvalidMountTarget(mount_point.to_string()));
        }

        let (ifs, storage_id) = {
            let mut registry = self.registry();
            let ifs = registry
                .get(linked_storage)
                .ok_or(IncrementalError::StorageNotFound(linked_storage))?;
            (ifs, registry.allocate_id())
        };

        let storage_root = match ifs.make_storage(self.deps.incfs.as_ref(), storage_id) {
            Ok(root) => root,
            Err(e) => {
                error!("can't create a new storage: {e}");
                self.registry().release(storage_id);
                return Err(IncrementalError::sys("make_storage", e));
            }
        };

        if let Err(e) = self.add_bind_mount(
            &ifs,
            storage_id,
            storage_root.clone(),
            path::normalize(mount_point),
            bind_kind(options),
            Some(storage_id),
        ) {
            error!("bind mount failed: {e}");
            if let Err(e) = self.deps.incfs.unlink(ifs.control(), &storage_root) {
                warn!("failed to remove storage dir {storage_root}: {e}");
            }
            ifs.lock().storages.remove(&storage_id);
            self.registry().release(storage_id);
            return Err(e);
        }
        Ok(storage_id)
    }

    pub fn open_storage(&self, path_in_mount: &str) -> Option<StorageId> {
        if !path::is_absolute(path_in_mount) {
            return None;
        }
        self.find_storage_id(&path::normalize(path_in_mount))
    }

    /// Storage owning `path` through the nearest enclosing bind point.
    pub fn find_storage_id(&self, path: &str) -> Option<StorageId> {
        self.registry().find_bind(path).map(|bind| bind.storage)
    }

    pub fn bind(
        &self,
        storage: StorageId,
        source: &str,
        target: &str,
        kind: BindKind,
    ) -> Result<()> {
        if !path::is_valid_mount_target(target) {
            error!("not a valid bind target {target}");
            return Err(IncrementalError::InvalidMountTarget(target.to_string()));
        }
        let ifs = self.require_ifs(storage)?;
        let norm_source = {
            let state = ifs.lock();
            let storage_root = &state
                .storages
                .get(&storage)
                .ok_or(IncrementalError::StorageNotFound(storage))?
                .name;
            normalize_path_to_storage_locked(&state, storage_root, source)
                .ok_or_else(|| IncrementalError::Unresolved(source.to_string(), storage))?
        };
        self.add_bind_mount(
            &ifs,
            storage,
            norm_source,
            path::normalize(target),
            kind,
            None,
        )
    }

    pub fn unbind(&self, storage: StorageId, target: &str) -> Result<()> {
        if !path::is_absolute(target) {
            return Err(IncrementalError::NotAbsolute(target.to_string()));
        }
        info!("removing bind point {target} for storage {storage}");

        // exact target only, a parent bind may belong to something unrelated
        let norm = path::normalize(target);
        let ifs = {
            let mut registry = self.registry();
            let bind = registry
                .bind_at(&norm)
                .filter(|bind| bind.storage == storage)
                .ok_or_else(|| IncrementalError::NotBound(norm.clone(), storage))?;
            let Some(ifs) = registry.get(bind.storage) else {
                error!("storage {storage} for bound path {target} is missing");
                return Err(IncrementalError::StorageNotFound(storage));
            };
            registry.remove_bind(&norm);
            ifs
        };

        if let Err(e) = self.deps.mounter.unmount_incfs(&norm) {
            warn!("failed to unmount {norm}: {e}");
        }
        let mut state = ifs.lock();
        if state.bind_points.len() <= 1 {
            state.bind_points.clear();
            self.delete_storage_locked(&ifs, state);
        } else {
            let saved = state
                .bind_points
                .remove(&PathKey::new(norm.as_str()))
                .map(|bind| bind.saved_filename)
                .unwrap_or_default();
            drop(state);
            if !saved.is_empty() {
                let record = path::join(&ifs.mount_dir(), &saved);
                if let Err(e) = self.deps.incfs.unlink(ifs.control(), &record) {
                    warn!("failed to remove bind record {record}: {e}");
                }
            }
        }
        Ok(())
    }

    /// Forgets every storage and bind point of the mount holding `storage`.
    /// The mount itself goes away with its last reference.
    pub fn delete_storage(&self, storage: StorageId) {
        let Some(ifs) = self.get_ifs(storage) else {
            return;
        };
        let state = ifs.lock();
        self.delete_storage_locked(&ifs, state);
    }

    pub(super) fn delete_storage_locked(
        &self,
        ifs: &Arc<IncFsMount>,
        mut state: MutexGuard<'_, MountState>,
    ) {
        let storages = mem::take(&mut state.storages);
        // bind points stay, the mount unmounts them when dropped
        let targets: Vec<PathKey> = state.bind_points.keys().cloned().collect();
        drop(state);

        let removed = {
            let mut registry = self.registry();
            let mut removed: Vec<Arc<IncFsMount>> = storages
                .keys()
                .filter(|id| **id != ifs.id())
                .filter_map(|id| registry.remove(*id))
                .collect();
            for target in &targets {
                if registry
                    .bind_at(target.as_str())
                    .is_some_and(|bind| bind.mount == ifs.id())
                {
                    registry.remove_bind(target.as_str());
                }
            }
            removed.extend(registry.remove(ifs.id()));
            removed
        };
        for id in storages.keys() {
            self.deps.progress_queue.remove_jobs(*id);
            if *id != ifs.id() {
                self.deps.timed_queue.remove_jobs(*id);
                self.ifs_callbacks.remove(*id);
            }
        }
        info!("deleted storages {:?} of mount {}", storages.keys(), ifs.id());
        drop(removed);
    }

    /// Persists a record for permanent binds, then bind-mounts `source` at
    /// `target`. `register` additionally publishes the mount under that
    /// storage id together with the bind.
    pub(super) fn add_bind_mount(
        &self,
        ifs: &Arc<IncFsMount>,
        storage: StorageId,
        source: String,
        target: String,
        kind: BindKind,
        register: Option<StorageId>,
    ) -> Result<()> {
        if !path::is_valid_mount_target(&target) {
            error!("invalid mount target {target}");
            return Err(IncrementalError::InvalidMountTarget(target));
        }
        if self.registry().bind_at(&target).is_some() {
            error!("{target} is already bound");
            return Err(IncrementalError::AlreadyBound(target));
        }

        let mut saved_filename = String::new();
        let mut record_path = String::new();
        if kind != BindKind::Temporary {
            let record = records::encode(&BindRecord {
                storage_id: storage,
                source_subdir: source.clone(),
                dest_path: target.clone(),
            })?;
            saved_filename = make_unique_name(MOUNTPOINT_RECORD_PREFIX);
            record_path = path::join(&ifs.mount_dir(), &saved_filename);
            self.deps
                .incfs
                .make_file(
                    ifs.control(),
                    &record_path,
                    0o444,
                    FileId::from_metadata(&record),
                    &NewFileParams {
                        size: 0,
                        metadata: record,
                        signature: Vec::new(),
                    },
                )
                .map_err(|e| {
                    error!("couldn't create a bind record {saved_filename}: {e}");
                    IncrementalError::sys("save bind record", e)
                })?;
        }

        let result = self.add_bind_mount_with_md(
            ifs,
            storage,
            saved_filename,
            source,
            target,
            kind,
            register,
        );
        if result.is_err() && !record_path.is_empty() {
            if let Err(e) = self.deps.incfs.unlink(ifs.control(), &record_path) {
                warn!("failed to remove bind record {record_path}: {e}");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn add_bind_mount_with_md(
        &self,
        ifs: &Arc<IncFsMount>,
        storage: StorageId,
        saved_filename: String,
        source: String,
        target: String,
        kind: BindKind,
        register: Option<StorageId>,
    ) -> Result<()> {
        {
            let _lock = self.mount_op_lock();
            self.deps
                .mounter
                .bind_mount(&source, &target)
                .map_err(|e| {
                    error!("bind_mount {source} -> {target} failed: {e}");
                    IncrementalError::sys("bind_mount", e)
                })?;
        }

        let mut registry = self.registry();
        if registry.bind_at(&target).is_some() {
            drop(registry);
            warn!("{target} got bound concurrently, undoing");
            if let Err(e) = self.deps.mounter.unmount_incfs(&target) {
                warn!("failed to unmount {target}: {e}");
            }
            return Err(IncrementalError::AlreadyBound(target));
        }
        if let Some(id) = register {
            if !registry.insert(id, ifs.clone()) {
                warn!("storage id {id} is taken by another mount");
            }
        }
        let mut state = ifs.lock();
        add_bind_record_locked(
            &mut registry,
            ifs.id(),
            &mut state,
            storage,
            saved_filename,
            source,
            target,
            kind,
        );
        Ok(())
    }
}
