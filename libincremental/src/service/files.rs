//! File operations inside storages and loading state queries.

use std::os::fd::AsFd;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{error, warn};

use super::IncrementalService;
use super::storage::normalize_path_to_storage_locked;
use crate::constants::BLOCK_SIZE;
use crate::error::{IncrementalError, Result};
use crate::incfs::DataBlock;
use crate::mount::IncFsMount;
use crate::types::{FileId, LoadingProgress, LoadingState, NewFileParams, StorageId};

impl IncrementalService {
    /// Resolves `path` within `storage` to a path inside its mount.
    pub(super) fn resolve_path(
        &self,
        storage: StorageId,
        path: &str,
    ) -> Result<(Arc<IncFsMount>, String)> {
        let ifs = self.require_ifs(storage)?;
        let resolved = {
            let state = ifs.lock();
            let storage_root = &state
                .storages
                .get(&storage)
                .ok_or(IncrementalError::StorageNotFound(storage))?
                .name;
            normalize_path_to_storage_locked(&state, storage_root, path)
        };
        match resolved {
            Some(resolved) => Ok((ifs, resolved)),
            None => {
                error!("internal error: storage {storage} cannot resolve {path}");
                Err(IncrementalError::Unresolved(path.to_string(), storage))
            }
        }
    }

    /// Creates a file of `params.size` bytes. `data`, if any, is written
    /// right away; short data must cover whole blocks.
    pub fn make_file(
        &self,
        storage: StorageId,
        path: &str,
        mode: u32,
        id: FileId,
        params: NewFileParams,
        data: &[u8],
    ) -> Result<()> {
        let size = u64::try_from(params.size)
            .map_err(|_| IncrementalError::InvalidArgument(format!("negative size of {path}")))?;
        if data.len() as u64 > size {
            error!("bad data size {} for file {path} of size {size}", data.len());
            return Err(IncrementalError::InvalidArgument(format!(
                "{} bytes of data for a {size} byte file",
                data.len()
            )));
        }
        if data.len() as u64 != size && data.len() % BLOCK_SIZE != 0 {
            error!("partial data for {path} is not block aligned: {}", data.len());
            return Err(IncrementalError::InvalidArgument(format!(
                "partial data of {path} must be a multiple of {BLOCK_SIZE} bytes"
            )));
        }

        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .make_file(ifs.control(), &norm_path, mode, id, &params)
            .map_err(|e| {
                error!("failed to create file {norm_path}: {e}");
                IncrementalError::sys("make_file", e)
            })?;

        if size > 0 {
            match self.deps.incfs.reserve_space(ifs.control(), id, Some(size)) {
                Ok(()) => {}
                Err(Errno::EOPNOTSUPP) => {
                    warn!("space reservation is not supported, {norm_path} keeps its size")
                }
                Err(e) => {
                    error!("failed to reserve {size} bytes for {norm_path}: {e}");
                    self.unlink_quietly(&ifs, &norm_path);
                    return Err(IncrementalError::sys("reserve_space", e));
                }
            }
        }

        if !data.is_empty() {
            if let Err(e) = self.set_file_content(&ifs, id, &norm_path, data) {
                self.unlink_quietly(&ifs, &norm_path);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn make_dir(&self, storage: StorageId, path: &str, mode: u32) -> Result<()> {
        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .make_dir(ifs.control(), &norm_path, mode)
            .map_err(|e| IncrementalError::sys("make_dir", e))
    }

    /// Like [`IncrementalService::make_dir`] but creates missing parents and
    /// accepts an existing directory.
    pub fn make_dirs(&self, storage: StorageId, path: &str, mode: u32) -> Result<()> {
        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .make_dirs(ifs.control(), &norm_path, mode)
            .map_err(|e| IncrementalError::sys("make_dirs", e))
    }

    /// Hard-links a file. Both storages have to live in the same mount.
    pub fn link(
        &self,
        source_storage: StorageId,
        old_path: &str,
        dest_storage: StorageId,
        new_path: &str,
    ) -> Result<()> {
        let (source_ifs, norm_old) = self.resolve_path(source_storage, old_path)?;
        let (dest_ifs, norm_new) = self.resolve_path(dest_storage, new_path)?;
        if !Arc::ptr_eq(&source_ifs, &dest_ifs) {
            error!("cannot link across mounts: storage {source_storage} and {dest_storage}");
            return Err(IncrementalError::InvalidArgument(format!(
                "storages {source_storage} and {dest_storage} are on different mounts"
            )));
        }
        self.deps
            .incfs
            .link(source_ifs.control(), &norm_old, &norm_new)
            .map_err(|e| IncrementalError::sys("link", e))
    }

    pub fn unlink(&self, storage: StorageId, path: &str) -> Result<()> {
        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .unlink(ifs.control(), &norm_path)
            .map_err(|e| IncrementalError::sys("unlink", e))
    }

    pub fn get_metadata_by_path(&self, storage: StorageId, path: &str) -> Result<Vec<u8>> {
        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .get_metadata_by_path(ifs.control(), &norm_path)
            .map_err(|e| IncrementalError::sys("get_metadata", e))
    }

    pub fn get_metadata_by_id(&self, storage: StorageId, id: FileId) -> Result<Vec<u8>> {
        let ifs = self.require_ifs(storage)?;
        self.deps
            .incfs
            .get_metadata(ifs.control(), id)
            .map_err(|e| IncrementalError::sys("get_metadata", e))
    }

    /// Writes `data` into file `id` block by block.
    pub(super) fn set_file_content(
        &self,
        ifs: &IncFsMount,
        id: FileId,
        path: &str,
        data: &[u8],
    ) -> Result<()> {
        let file = self
            .deps
            .incfs
            .open_for_special_ops(ifs.control(), id)
            .map_err(|e| {
                error!("failed to open {path} ({id}) for writing: {e}");
                IncrementalError::sys("open_for_special_ops", e)
            })?;
        let blocks: Vec<DataBlock<'_>> = data
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(|(index, chunk)| DataBlock {
                file: file.as_fd(),
                page_index: index as u32,
                data: chunk,
            })
            .collect();
        let written = self
            .deps
            .incfs
            .write_blocks(&blocks)
            .map_err(|e| {
                error!("failed to write data of {path}: {e}");
                IncrementalError::sys("write_blocks", e)
            })?;
        if written != blocks.len() {
            error!("wrote {written} of {} blocks of {path}", blocks.len());
            return Err(IncrementalError::sys("write_blocks", Errno::EIO));
        }
        Ok(())
    }

    fn unlink_quietly(&self, ifs: &IncFsMount, path: &str) {
        if let Err(e) = self.deps.incfs.unlink(ifs.control(), path) {
            warn!("failed to remove {path}: {e}");
        }
    }

    pub fn is_file_fully_loaded(&self, storage: StorageId, path: &str) -> Result<LoadingState> {
        let (ifs, norm_path) = self.resolve_path(storage, path)?;
        self.deps
            .incfs
            .is_file_fully_loaded(ifs.control(), &norm_path)
            .map_err(|e| {
                error!("is_file_fully_loaded failed for {norm_path}: {e}");
                IncrementalError::sys("is_file_fully_loaded", e)
            })
    }

    pub fn is_mount_fully_loaded(&self, storage: StorageId) -> Result<LoadingState> {
        let ifs = self.require_ifs(storage)?;
        self.deps
            .incfs
            .is_everything_fully_loaded(ifs.control())
            .map_err(|e| {
                error!("is_everything_fully_loaded failed for storage {storage}: {e}");
                IncrementalError::sys("is_everything_fully_loaded", e)
            })
    }

    /// Sums filled and total blocks over every file of the storage.
    pub fn get_loading_progress(&self, storage: StorageId) -> Result<LoadingProgress> {
        let ifs = self.require_ifs(storage)?;
        let storage_root = ifs
            .lock()
            .storages
            .get(&storage)
            .map(|s| s.name.clone())
            .ok_or(IncrementalError::StorageNotFound(storage))?;
        self.loading_progress_at(&ifs, &storage_root)
    }

    pub(super) fn loading_progress_at(
        &self,
        ifs: &IncFsMount,
        storage_root: &str,
    ) -> Result<LoadingProgress> {
        let mut progress = LoadingProgress::default();
        let mut failure = None;
        self.deps.fs.list_files_recursive(storage_root, &mut |file| {
            match self.deps.incfs.count_filled_blocks(ifs.control(), file) {
                Ok((filled, total)) => {
                    progress.filled_blocks += filled;
                    progress.total_blocks += total;
                    true
                }
                // not an incremental file, or gone while walking
                Err(Errno::EOPNOTSUPP | Errno::ENOENT) => true,
                Err(e) => {
                    error!("get_loading_progress failed for {file}: {e}");
                    failure = Some(e);
                    false
                }
            }
        })?;
        match failure {
            Some(e) => Err(IncrementalError::sys("count_filled_blocks", e)),
            None => Ok(progress),
        }
    }
}
