//! Per-storage metrics and the human readable state dump.

use std::io::{self, Write};
use std::time::Duration;

use tracing::error;

use super::IncrementalService;
use crate::error::{IncrementalError, Result};
use crate::mount::LoadingStart;
use crate::types::{LoadingState, MetricValue, Metrics, StorageId, metric_keys};

fn loading_state_name(state: std::result::Result<LoadingState, nix::errno::Errno>) -> String {
    match state {
        Ok(LoadingState::Full) => "fully loaded".to_string(),
        Ok(LoadingState::MissingBlocks) => "loading".to_string(),
        Err(e) => format!("error obtaining loading state: {e}"),
    }
}

/// Counter sum, saturating at `i32::MAX`.
fn clamped_int<const N: usize>(counters: [u32; N]) -> MetricValue {
    let sum = counters.iter().map(|&c| u64::from(c)).sum::<u64>();
    MetricValue::Int(i32::try_from(sum).unwrap_or(i32::MAX))
}

impl IncrementalService {
    pub fn get_metrics(&self, storage: StorageId) -> Result<Metrics> {
        let Some(ifs) = self.get_ifs(storage) else {
            error!("get_metrics failed, invalid storage {storage}");
            return Err(IncrementalError::StorageNotFound(storage));
        };
        let mut metrics = Metrics::default();
        metrics.put(
            metric_keys::READ_LOGS_ENABLED,
            MetricValue::Bool(ifs.lock().read_logs_enabled()),
        );

        if let Some(incfs) = self.deps.incfs.get_metrics(ifs.metrics_key()) {
            metrics.put(
                metric_keys::TOTAL_DELAYED_READS,
                clamped_int([incfs.reads_delayed_min, incfs.reads_delayed_pending]),
            );
            metrics.put(
                metric_keys::TOTAL_FAILED_READS,
                clamped_int([
                    incfs.reads_failed_timed_out,
                    incfs.reads_failed_hash_verification,
                    incfs.reads_failed_other,
                ]),
            );
            metrics.put(
                metric_keys::TOTAL_DELAYED_READS_MILLIS,
                MetricValue::millis(Duration::from_micros(
                    incfs
                        .reads_delayed_min_us
                        .saturating_add(incfs.reads_delayed_pending_us),
                )),
            );
        }

        if let Some(read_error) = self
            .deps
            .incfs
            .get_last_read_error(ifs.control())
            .filter(|e| e.timestamp_us != 0)
        {
            let since_us = self
                .deps
                .clock
                .boot_time_us()
                .saturating_sub(read_error.timestamp_us);
            metrics.put(
                metric_keys::MILLIS_SINCE_LAST_READ_ERROR,
                MetricValue::millis(Duration::from_micros(since_us)),
            );
            metrics.put(
                metric_keys::LAST_READ_ERROR_NO,
                MetricValue::Int(read_error.error_no),
            );
            metrics.put(
                metric_keys::LAST_READ_ERROR_UID,
                MetricValue::Int(read_error.uid),
            );
        }

        let stub = ifs.lock().stub.clone();
        if let Some(stub) = stub {
            stub.metrics(&mut metrics);
        }
        Ok(metrics)
    }

    /// Writes the state of every mount and bind point to `out`.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "IncFs features: {:#x}", self.deps.incfs.features().bits())?;
        writeln!(out, "Incremental dir: {}", self.root)?;

        let (entries, binds) = {
            let registry = self.registry();
            let binds: Vec<_> = registry
                .binds()
                .map(|(target, bind)| (target.to_string(), *bind))
                .collect();
            (registry.entries(), binds)
        };

        writeln!(out, "Mounts ({}): {{", entries.len())?;
        for (id, ifs) in &entries {
            writeln!(out, "  [{id}]: {{")?;
            if *id != ifs.id() {
                writeln!(out, "    reference to mountId: {}", ifs.id())?;
                writeln!(out, "  }}")?;
                continue;
            }
            let (flags, loading_start, stub, storages, bind_points) = {
                let state = ifs.lock();
                (
                    state.flags,
                    state.loading_start,
                    state.stub.clone(),
                    state.storages.clone(),
                    state.bind_points.clone(),
                )
            };
            writeln!(out, "    mountId: {}", ifs.id())?;
            writeln!(out, "    root: {}", ifs.root())?;
            writeln!(out, "    metrics instance name: {}", ifs.metrics_key())?;
            writeln!(out, "    nextStorageDirNo: {}", ifs.next_storage_dir_no())?;
            writeln!(out, "    flags: {}", flags.bits())?;
            match loading_start {
                LoadingStart::NotStarted => writeln!(out, "    not loading")?,
                LoadingStart::Unlimited => writeln!(out, "    startLoading: unlimited")?,
                LoadingStart::At(ts) => writeln!(
                    out,
                    "    startLoading: {}s",
                    self.deps.clock.now().saturating_duration_since(ts).as_secs()
                )?,
            }
            match &stub {
                Some(stub) => stub.dump(out)?,
                None => writeln!(out, "    dataLoader: null")?,
            }

            let loading_state = loading_state_name(
                self.deps.incfs.is_everything_fully_loaded(ifs.control()),
            );
            writeln!(out, "    storages ({}): {{", storages.len())?;
            for (storage_id, storage) in &storages {
                let percent = self
                    .loading_progress_at(ifs, &storage.name)
                    .map(|p| (p.progress() * 100.0) as i32)
                    .unwrap_or_default();
                writeln!(
                    out,
                    "      [{storage_id}] -> [{}] ({percent} % loaded)({loading_state})",
                    storage.name
                )?;
            }
            writeln!(out, "    }}")?;

            writeln!(out, "    bindPoints ({}): {{", bind_points.len())?;
            for (target, bind) in &bind_points {
                writeln!(out, "      [{target}]->[{}]:", bind.storage)?;
                writeln!(out, "        savedFilename: {}", bind.saved_filename)?;
                writeln!(out, "        sourceDir: {}", bind.source_dir)?;
                writeln!(out, "        kind: {:?}", bind.kind)?;
            }
            writeln!(out, "    }}")?;

            writeln!(out, "    incfsMetrics: {{")?;
            match self.deps.incfs.get_metrics(ifs.metrics_key()) {
                Some(m) => {
                    writeln!(out, "      readsDelayedMin: {}", m.reads_delayed_min)?;
                    writeln!(out, "      readsDelayedMinUs: {}", m.reads_delayed_min_us)?;
                    writeln!(out, "      readsDelayedPending: {}", m.reads_delayed_pending)?;
                    writeln!(out, "      readsDelayedPendingUs: {}", m.reads_delayed_pending_us)?;
                    writeln!(
                        out,
                        "      readsFailedHashVerification: {}",
                        m.reads_failed_hash_verification
                    )?;
                    writeln!(out, "      readsFailedOther: {}", m.reads_failed_other)?;
                    writeln!(out, "      readsFailedTimedOut: {}", m.reads_failed_timed_out)?;
                }
                None => writeln!(out, "      Metrics not available.")?,
            }
            writeln!(out, "    }}")?;

            writeln!(out, "    lastReadError: {{")?;
            match self.deps.incfs.get_last_read_error(ifs.control()) {
                Some(e) if e.timestamp_us == 0 => writeln!(out, "      No read errors.")?,
                Some(e) => {
                    writeln!(out, "      fileId: {}", e.id)?;
                    writeln!(
                        out,
                        "      time: {} microseconds ago",
                        self.deps.clock.boot_time_us().saturating_sub(e.timestamp_us)
                    )?;
                    writeln!(out, "      blockIndex: {}", e.block)?;
                    writeln!(out, "      errno: {}", e.error_no)?;
                }
                None => writeln!(out, "      Info not available.")?,
            }
            writeln!(out, "    }}")?;
            writeln!(out, "  }}")?;
        }
        writeln!(out, "}}")?;

        writeln!(out, "Sorted binds ({}): {{", binds.len())?;
        for (target, bind) in &binds {
            writeln!(out, "  [{target}]->[{}]", bind.storage)?;
        }
        writeln!(out, "}}")
    }
}
