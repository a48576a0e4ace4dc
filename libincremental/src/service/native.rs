//! Native library setup for installed packages.
//!
//! Libraries of an archive are placed next to it, e.g. for `/path/base.apk`:
//! `/path/lib/arm/first.so`. Files are either mapped onto the archive data
//! or created empty and filled by background extraction jobs.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{error, info, warn};

use super::IncrementalService;
use crate::archive::{Archive, ArchiveEntry};
use crate::constants::{BLOCK_SIZE, LIB_DIR, LIB_SUFFIX};
use crate::incfs::Features;
use crate::jobs::Job;
use crate::mount::IncFsMount;
use crate::path;
use crate::types::{FileId, NewFileParams, StorageId};

fn is_page_aligned(offset: u64) -> bool {
    offset % BLOCK_SIZE as u64 == 0
}

fn micros_between(from: Instant, to: Instant) -> u128 {
    to.saturating_duration_since(from).as_micros()
}

impl IncrementalService {
    /// Lays out the `lib/<abi>` libraries of the archive at `apk_path`.
    /// Without `extract`, only checks that every library can be mapped in
    /// place.
    pub fn configure_native_binaries(
        &self,
        storage: StorageId,
        apk_path: &str,
        lib_dir: &str,
        abi: &str,
        extract: bool,
    ) -> bool {
        let start = Instant::now();
        let Ok((ifs, apk_in_mount)) = self.resolve_path(storage, apk_path) else {
            error!("invalid storage {storage} or path {apk_path}");
            return false;
        };

        let target_lib_dir = path::join(path::dirname(&apk_in_mount), lib_dir);
        if let Err(e) = self.make_dirs(storage, &target_lib_dir, 0o755) {
            error!("failed to prepare target lib directory {target_lib_dir}: {e}");
            return false;
        }
        let make_dirs_ts = Instant::now();

        let archive = match self.deps.archive_reader.open(apk_path) {
            Ok(archive) => archive,
            Err(e) => {
                error!("failed to open archive at {apk_path}: {e}");
                return false;
            }
        };
        let prefix = format!("{}/", path::join(LIB_DIR, abi));
        let entries = archive.entries(&prefix, LIB_SUFFIX);
        let open_archive_ts = Instant::now();

        let mut source_id = None;
        if self.deps.incfs.features().contains(Features::V2) {
            match self.deps.incfs.get_file_id(ifs.control(), apk_path) {
                Ok(id) if id.is_valid() => source_id = Some(id),
                _ => warn!("no file id for archive '{apk_path}', mapping disabled"),
            }
        }

        let mut jobs: Vec<Job> = Vec::new();
        for entry in entries {
            if entry.name.is_empty() {
                continue;
            }
            let aligned = is_page_aligned(entry.data_offset);

            if !extract {
                if !entry.stored {
                    warn!("library {} must be uncompressed to mmap it", entry.name);
                    return false;
                }
                if !aligned {
                    warn!(
                        "library {} must be page-aligned to mmap it, offset = {:#x}",
                        entry.name, entry.data_offset
                    );
                    return false;
                }
                continue;
            }

            let file_start = Instant::now();
            let lib_name = path::basename(&entry.name).to_string();
            let target_lib_path = path::join(&target_lib_dir, &lib_name);
            let Ok((_, target_absolute)) = self.resolve_path(storage, &target_lib_path) else {
                error!("cannot resolve {target_lib_path} in storage {storage}");
                return false;
            };
            if Path::new(&target_absolute).exists() {
                if self.config.perf_logging {
                    info!(
                        "incfs: native lib file already exists: {target_lib_path}; skipping extraction, spent {}mcs",
                        micros_between(file_start, Instant::now())
                    );
                }
                continue;
            }

            if let Some(source) = source_id {
                if entry.stored && aligned && entry.uncompressed_length > 0 {
                    match self.deps.incfs.make_mapped_file(
                        ifs.control(),
                        &target_absolute,
                        0o755,
                        source,
                        entry.data_offset,
                        entry.uncompressed_length,
                    ) {
                        Ok(()) => {
                            if self.config.perf_logging {
                                info!(
                                    "incfs: mapped {lib_name}: {}mcs",
                                    micros_between(file_start, Instant::now())
                                );
                            }
                            continue;
                        }
                        Err(e) => warn!(
                            "failed to map file for '{target_lib_path}': {e}; falling back to full extraction"
                        ),
                    }
                }
            }

            // the metadata of a library file is its path
            let lib_file_id = FileId::from_metadata(target_lib_path.as_bytes());
            let params = NewFileParams {
                size: entry.uncompressed_length as i64,
                metadata: target_lib_path.as_bytes().to_vec(),
                signature: Vec::new(),
            };
            if let Err(e) = self.deps.incfs.make_file(
                ifs.control(),
                &target_absolute,
                0o755,
                lib_file_id,
                &params,
            ) {
                error!("failed to make file for {target_lib_path}: {e}");
                // one missing library fails the whole set
                return false;
            }
            let make_file_ts = Instant::now();

            if entry.uncompressed_length == 0 {
                if self.config.perf_logging {
                    info!(
                        "incfs: extracted {lib_name} (0 bytes): {}mcs",
                        micros_between(file_start, make_file_ts)
                    );
                }
                continue;
            }

            jobs.push(self.extraction_job(
                Arc::downgrade(&ifs),
                archive.clone(),
                entry,
                lib_file_id,
                target_lib_path,
                make_file_ts,
            ));
        }
        let processed_ts = Instant::now();

        if !jobs.is_empty() && !self.jobs.schedule(ifs.id(), jobs) {
            warn!("job processor is stopped, libraries of storage {storage} stay empty");
        }

        if self.config.perf_logging {
            let end = Instant::now();
            info!(
                "incfs: configure_native_binaries complete in {}mcs, make dirs: {} open archive: {} make files: {} schedule jobs: {}",
                micros_between(start, end),
                micros_between(start, make_dirs_ts),
                micros_between(make_dirs_ts, open_archive_ts),
                micros_between(open_archive_ts, processed_ts),
                micros_between(processed_ts, end)
            );
        }
        true
    }

    fn extraction_job(
        &self,
        ifs: Weak<IncFsMount>,
        archive: Arc<dyn Archive>,
        entry: ArchiveEntry,
        id: FileId,
        lib_path: String,
        scheduled: Instant,
    ) -> Job {
        let service = self.weak_self.clone();
        Box::new(move || {
            let (Some(service), Some(ifs)) = (service.upgrade(), ifs.upgrade()) else {
                info!("skipping extraction of {lib_path} for an expired mount");
                return;
            };
            let started = Instant::now();
            let data = match archive.extract(&entry) {
                Ok(data) => data,
                Err(e) => {
                    error!(
                        "failed to extract native lib entry {}: {e}",
                        path::basename(&lib_path)
                    );
                    return;
                }
            };
            let extracted = Instant::now();
            if let Err(e) = service.set_file_content(&ifs, id, &lib_path, &data) {
                error!("failed to write {lib_path}: {e}");
                return;
            }
            if service.config.perf_logging {
                let end = Instant::now();
                info!(
                    "incfs: extracted {} ({} -> {} bytes): {}mcs, scheduling delay: {} extract: {} write: {}",
                    path::basename(&lib_path),
                    entry.compressed_length,
                    entry.uncompressed_length,
                    micros_between(started, end),
                    micros_between(scheduled, started),
                    micros_between(started, extracted),
                    micros_between(extracted, end)
                );
            }
        })
    }

    /// Blocks until every extraction job of the mount holding `storage` ran.
    pub fn wait_for_native_binaries_extraction(&self, storage: StorageId) -> bool {
        let Some(ifs) = self.get_ifs(storage) else {
            error!("invalid storage {storage}");
            return true;
        };
        let start = Instant::now();
        let done = self.jobs.wait_for(ifs.id());
        if self.config.perf_logging {
            info!(
                "incfs: waited for native lib extraction for {}mcs",
                micros_between(start, Instant::now())
            );
        }
        done
    }
}
