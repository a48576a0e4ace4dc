//! Global lookup tables: storage ids to mounts, bind targets to storages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::mount::IncFsMount;
use crate::path::{self, PathKey};
use crate::types::{MAX_STORAGE_ID, MountId, StorageId};

/// Entry of the global bind index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRef {
    pub mount: MountId,
    pub storage: StorageId,
}

/// Every storage id maps to the mount holding it; a mount is registered
/// under its own id as well, which is the id of its default storage.
#[derive(Default)]
pub struct Registry {
    mounts: HashMap<StorageId, Arc<IncFsMount>>,
    reserved: HashSet<StorageId>,
    binds_by_path: BTreeMap<PathKey, BindRef>,
    next_id: StorageId,
}

impl Registry {
    /// Reserves a fresh storage id. The slot stays taken until it is filled
    /// with [`Registry::insert`] or given back with [`Registry::release`].
    pub fn allocate_id(&mut self) -> StorageId {
        loop {
            if self.next_id >= MAX_STORAGE_ID {
                self.next_id = 0;
            }
            self.next_id += 1;
            let id = self.next_id;
            if !self.mounts.contains_key(&id) && self.reserved.insert(id) {
                return id;
            }
        }
    }

    /// Makes sure ids handed out later are above `id`.
    pub fn observe_id(&mut self, id: StorageId) {
        self.next_id = self.next_id.max(id);
    }

    pub fn release(&mut self, id: StorageId) {
        self.reserved.remove(&id);
    }

    /// Registers `mount` under `id`. Fails if the id is held by another mount.
    pub fn insert(&mut self, id: StorageId, mount: Arc<IncFsMount>) -> bool {
        self.reserved.remove(&id);
        match self.mounts.get(&id) {
            Some(existing) if !Arc::ptr_eq(existing, &mount) => false,
            _ => {
                self.mounts.insert(id, mount);
                true
            }
        }
    }

    pub fn contains(&self, id: StorageId) -> bool {
        self.mounts.contains_key(&id) || self.reserved.contains(&id)
    }

    pub fn get(&self, id: StorageId) -> Option<Arc<IncFsMount>> {
        self.mounts.get(&id).cloned()
    }

    pub fn remove(&mut self, id: StorageId) -> Option<Arc<IncFsMount>> {
        self.mounts.remove(&id)
    }

    /// Mounts registered under their own id, ordered by id.
    pub fn mounts(&self) -> Vec<Arc<IncFsMount>> {
        let mut mounts: Vec<_> = self
            .mounts
            .iter()
            .filter(|(id, mount)| **id == mount.id())
            .map(|(_, mount)| mount.clone())
            .collect();
        mounts.sort_by_key(|mount| mount.id());
        mounts
    }

    /// All (storage id, mount) pairs ordered by storage id.
    pub fn entries(&self) -> Vec<(StorageId, Arc<IncFsMount>)> {
        let mut entries: Vec<_> = self
            .mounts
            .iter()
            .map(|(id, mount)| (*id, mount.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn add_bind(&mut self, target: &str, bind: BindRef) {
        self.binds_by_path.insert(PathKey::new(target), bind);
    }

    pub fn remove_bind(&mut self, target: &str) -> Option<BindRef> {
        self.binds_by_path.remove(&PathKey::new(target))
    }

    /// Bind registered for exactly `target`.
    pub fn bind_at(&self, target: &str) -> Option<BindRef> {
        self.binds_by_path.get(&PathKey::new(target)).copied()
    }

    /// Bind whose target is `path` or its nearest ancestor.
    pub fn find_bind(&self, path: &str) -> Option<BindRef> {
        path::find_parent(&self.binds_by_path, path).map(|(_, bind)| *bind)
    }

    pub fn binds(&self) -> impl Iterator<Item = (&PathKey, &BindRef)> {
        self.binds_by_path.iter()
    }

    /// Empties every table and hands the mounts back so they are dropped
    /// outside the caller's lock.
    pub fn clear(&mut self) -> Vec<Arc<IncFsMount>> {
        self.binds_by_path.clear();
        self.reserved.clear();
        self.mounts.drain().map(|(_, mount)| mount).collect()
    }
}
