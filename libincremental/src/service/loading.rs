//! Data loader lifecycle, read logs and timeouts, listeners.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{IncrementalService, IncrementalServiceConnector};
use crate::constants::{
    IFS_STATE_INTERVAL, INTERACT_ACROSS_USERS_PERMISSION, LOADER_USAGE_STATS_OP,
    LOADER_USAGE_STATS_PERMISSION, MIN_PER_UID_TIMEOUT, PER_UID_TIMEOUT_OFFSET,
    PROGRESS_UPDATE_INTERVAL, READ_LOGS_DISABLED_MARKER,
};
use crate::data_loader::{DataLoaderStub, StubContext, StubParams};
use crate::error::{IncrementalError, Result};
use crate::incfs::Features;
use crate::jobs::IfsStateCallback;
use crate::loader::{DataLoaderStatusListener, LoadingProgressListener, StorageHealthListener};
use crate::mount::{IncFsMount, LoadingStart, MountState, StorageFlags};
use crate::path;
use crate::permissions::{AppOpsCallback, GET_USAGE_STATS_OP};
use crate::types::{
    ALL_STORAGES_ID, DataLoaderParams, FileId, HealthCheckParams, IfsState, LoadingState,
    NewFileParams, PerUidReadTimeouts, StorageId,
};

/// Watches usage stats access of one package.
pub(crate) struct AppOpsListener {
    service: Weak<IncrementalService>,
    package: String,
}

impl AppOpsCallback for AppOpsListener {
    fn op_changed(&self, op: i32, package: &str) {
        debug!("app op {op} changed for {package}");
        if let Some(service) = self.service.upgrade() {
            service.on_app_op_changed(&self.package);
        }
    }
}

impl IncrementalService {
    fn stub_context(&self) -> StubContext {
        StubContext {
            manager: self.deps.data_loader_manager.clone(),
            incfs: self.deps.incfs.clone(),
            looper: self.deps.looper.clone(),
            timed_queue: self.deps.timed_queue.clone(),
            clock: self.deps.clock.clone(),
            ifs_callbacks: self.ifs_callbacks.clone(),
        }
    }

    /// Creates the data loader stub of `ifs` and the mount state callbacks
    /// that release it once loading is over.
    pub(super) fn prepare_data_loader_locked(
        &self,
        ifs: &IncFsMount,
        state: &mut MountState,
        params: DataLoaderParams,
        status_listener: Option<Arc<dyn DataLoaderStatusListener>>,
        health_check: HealthCheckParams,
        health_listener: Option<Arc<dyn StorageHealthListener>>,
    ) -> Result<Arc<DataLoaderStub>> {
        let mount_id = ifs.id();
        let stub = DataLoaderStub::new(
            self.stub_context(),
            StubParams {
                id: mount_id,
                params,
                control: ifs.control().duplicate()?,
                connector: Arc::new(IncrementalServiceConnector::new(
                    self.weak_self.clone(),
                    mount_id,
                )),
                status_listener,
                health_check,
                health_listener,
                health_path: ifs.mount_dir(),
            },
        );
        state.stub = Some(stub.clone());

        if !self.deps.incfs.features().contains(Features::V2) {
            // reservations are not trimmed by the filesystem itself
            let weak = self.weak_self.clone();
            self.add_ifs_state_callback(
                mount_id,
                Box::new(move |storage, ifs_state| {
                    if !ifs_state.fully_loaded {
                        return true;
                    }
                    if let Some(service) = weak.upgrade() {
                        service.trim_reserved_space(storage);
                    }
                    false
                }),
            );
        }

        let weak = self.weak_self.clone();
        self.add_ifs_state_callback(
            mount_id,
            Box::new(move |storage, ifs_state| {
                if !ifs_state.fully_loaded || ifs_state.read_logs_enabled {
                    return true;
                }
                let Some(ifs) = weak.upgrade().and_then(|service| service.get_ifs(storage))
                else {
                    return false;
                };
                let stub = ifs.lock().stub.take();
                if let Some(stub) = stub {
                    info!("mount {storage} is fully loaded, releasing its data loader");
                    stub.cleanup_resources();
                }
                false
            }),
        );
        Ok(stub)
    }

    fn trim_reserved_space(&self, storage: StorageId) {
        let Some(ifs) = self.get_ifs(storage) else {
            return;
        };
        let incfs = &self.deps.incfs;
        let result = incfs.for_each_file(ifs.control(), &mut |id: FileId| {
            if matches!(
                incfs.is_file_fully_loaded_by_id(ifs.control(), id),
                Ok(LoadingState::Full)
            ) {
                if let Err(e) = incfs.reserve_space(ifs.control(), id, None) {
                    debug!("failed to trim reservation of {id}: {e}");
                }
            }
            true
        });
        if let Err(e) = result {
            warn!("failed to trim reserved space of mount {storage}: {e}");
        }
    }

    /// Sets up the data loader of the mount holding `storage` and asks it to
    /// start streaming. An existing loader is torn down first.
    pub fn start_loading(
        &self,
        storage: StorageId,
        params: DataLoaderParams,
        status_listener: Option<Arc<dyn DataLoaderStatusListener>>,
        health_check: HealthCheckParams,
        health_listener: Option<Arc<dyn StorageHealthListener>>,
        per_uid_read_timeouts: Vec<PerUidReadTimeouts>,
    ) -> bool {
        let Some(ifs) = self.get_ifs(storage) else {
            return false;
        };
        if !per_uid_read_timeouts.is_empty() {
            self.set_uid_read_timeouts(storage, &per_uid_read_timeouts);
        }

        let old = ifs.lock().stub.take();
        if let Some(old) = old {
            old.cleanup_resources();
        }

        let stub = {
            let mut state = ifs.lock();
            if state.stub.is_some() {
                info!("skipped data loader creation for storage {storage}, one already exists");
                return false;
            }
            let stub = match self.prepare_data_loader_locked(
                &ifs,
                &mut state,
                params,
                status_listener,
                health_check,
                health_listener,
            ) {
                Ok(stub) => stub,
                Err(e) => {
                    error!("failed to prepare data loader for storage {storage}: {e}");
                    return false;
                }
            };
            // long read timeouts come back once the installation completes
            let timeouts = stub.is_system_data_loader()
                && self.config.always_enable_read_timeouts_for_system_dataloaders;
            state.set(StorageFlags::READ_TIMEOUTS_REQUESTED, timeouts);
            if let Err(e) = self.apply_storage_params_locked(&ifs, &mut state) {
                warn!("failed to apply storage params of storage {storage}: {e}");
            }

            if stub.is_system_data_loader()
                && !self.config.enforce_readlogs_max_interval_for_system_dataloaders
            {
                state.loading_start = LoadingStart::Unlimited;
            } else {
                let started = self.deps.clock.now();
                state.loading_start = LoadingStart::At(started);
                self.schedule_read_logs_expiry(ifs.id(), started);
            }
            stub
        };
        stub.request_start()
    }

    fn schedule_read_logs_expiry(&self, mount_id: StorageId, started: Instant) {
        let weak = self.weak_self.clone();
        self.deps.timed_queue.add_job(
            mount_id,
            self.config.read_logs_max_interval(),
            Box::new(move || {
                let Some(service) = weak.upgrade() else {
                    return;
                };
                let Some(ifs) = service.get_ifs(mount_id) else {
                    warn!("can't disable read logs, storage {mount_id} is gone");
                    return;
                };
                let mut state = ifs.lock();
                if state.loading_start != LoadingStart::At(started) {
                    info!("can't disable read logs of {mount_id}, loading restarted since");
                    return;
                }
                if let Err(e) = service.disable_read_logs_locked(&ifs, &mut state) {
                    warn!("failed to disable read logs of {mount_id}: {e}");
                }
            }),
        );
    }

    pub fn on_installation_complete(&self, storage: StorageId) {
        let Some(ifs) = self.get_ifs(storage) else {
            return;
        };
        let mut state = ifs.lock();
        state.set(
            StorageFlags::READ_TIMEOUTS_REQUESTED,
            self.config.enable_read_timeouts_after_install,
        );
        if let Err(e) = self.apply_storage_params_locked(&ifs, &mut state) {
            warn!("failed to apply storage params of storage {storage}: {e}");
        }
    }

    /// Turns read logs of the mount holding `storage` on or off.
    pub fn set_storage_params(&self, storage: StorageId, enable_read_logs: bool) -> Result<()> {
        let Some(ifs) = self.get_ifs(storage) else {
            error!("set_storage_params failed, invalid storage {storage}");
            return Err(IncrementalError::StorageNotFound(storage));
        };

        let package = {
            let mut state = ifs.lock();
            if !enable_read_logs {
                return self.disable_read_logs_locked(&ifs, &mut state);
            }
            if !state.read_logs_allowed() {
                error!("enabling read logs failed, disallowed for storage {storage}");
                return Err(IncrementalError::PermissionDenied(format!(
                    "read logs are disallowed for storage {storage}"
                )));
            }
            let Some(stub) = state.stub.clone() else {
                error!("enabling read logs failed, no data loader for storage {storage}");
                return Err(IncrementalError::PermissionDenied(format!(
                    "storage {storage} has no data loader"
                )));
            };
            let now = self.deps.clock.now();
            if state
                .loading_start
                .window_closed(now, self.config.read_logs_max_interval())
            {
                error!("read logs can't be enabled at this time for storage {storage}");
                return Err(IncrementalError::PermissionDenied(format!(
                    "read log window of storage {storage} is closed"
                )));
            }
            state.set(StorageFlags::READ_LOGS_REQUESTED, true);
            stub.params().package_name
        };

        for (permission, operation) in [
            (LOADER_USAGE_STATS_PERMISSION, Some(LOADER_USAGE_STATS_OP)),
            (INTERACT_ACROSS_USERS_PERMISSION, None),
        ] {
            if !self
                .deps
                .app_ops
                .check_permission(permission, operation, &package)
            {
                error!("permission {permission} check failed for {package}");
                return Err(IncrementalError::PermissionDenied(format!(
                    "{package} lacks {permission}"
                )));
            }
        }

        {
            let mut state = ifs.lock();
            if !state.has(StorageFlags::READ_LOGS_REQUESTED) {
                return Ok(());
            }
            self.apply_storage_params_locked(&ifs, &mut state)?;
        }
        self.register_app_ops_callback(&package);
        Ok(())
    }

    pub(super) fn disable_read_logs_locked(
        &self,
        ifs: &IncFsMount,
        state: &mut MountState,
    ) -> Result<()> {
        state.set(StorageFlags::READ_LOGS_REQUESTED, false);
        self.apply_storage_params_locked(ifs, state)
    }

    fn apply_storage_params_locked(&self, ifs: &IncFsMount, state: &mut MountState) -> Result<()> {
        let control = ifs.control().duplicate()?;
        let read_logs = state.has(StorageFlags::READ_LOGS_REQUESTED);
        let read_timeouts = state.has(StorageFlags::READ_TIMEOUTS_REQUESTED);
        let result = {
            let _lock = self.mount_op_lock();
            self.deps.mounter.set_incfs_mount_options(
                control,
                read_logs,
                read_timeouts,
                ifs.metrics_key(),
            )
        };
        match result {
            Ok(()) => {
                state.set(StorageFlags::READ_LOGS_ENABLED, read_logs);
                state.set(StorageFlags::READ_TIMEOUTS_ENABLED, read_timeouts);
                Ok(())
            }
            Err(e) => {
                error!(
                    "set_incfs_mount_options(read_logs: {read_logs}, read_timeouts: {read_timeouts}) failed for mount {}: {e}",
                    ifs.id()
                );
                Err(IncrementalError::sys("set_incfs_mount_options", e))
            }
        }
    }

    /// Forbids read logs of the mount for good, across restarts too.
    pub fn disallow_read_logs(&self, storage: StorageId) -> Result<()> {
        let ifs = self.require_ifs(storage)?;
        let mut state = ifs.lock();
        if !state.read_logs_allowed() {
            return Ok(());
        }
        state.disallow_read_logs();

        let marker = path::join(&ifs.mount_dir(), READ_LOGS_DISABLED_MARKER);
        self.deps
            .incfs
            .make_file(
                ifs.control(),
                &marker,
                0o777,
                FileId::from_metadata(READ_LOGS_DISABLED_MARKER.as_bytes()),
                &NewFileParams::default(),
            )
            .map_err(|e| {
                error!("failed to make read logs disabled marker {marker}: {e}");
                IncrementalError::sys("make_file", e)
            })?;
        self.disable_read_logs_locked(&ifs, &mut state)
    }

    fn register_app_ops_callback(&self, package: &str) {
        let listener = {
            let mut callbacks = self
                .app_ops_callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if callbacks.contains_key(package) {
                return;
            }
            let listener = Arc::new(AppOpsListener {
                service: self.weak_self.clone(),
                package: package.to_string(),
            });
            callbacks.insert(package.to_string(), listener.clone());
            listener
        };
        self.deps
            .app_ops
            .start_watching_mode(GET_USAGE_STATS_OP, package, listener);
    }

    fn unregister_app_ops_callback(&self, package: &str) -> bool {
        let listener = self
            .app_ops_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(package);
        match listener {
            Some(listener) => {
                self.deps.app_ops.stop_watching_mode(listener);
                true
            }
            None => false,
        }
    }

    /// Usage stats access of `package` changed: read logs of every mount
    /// loaded by it go off until requested again.
    pub(super) fn on_app_op_changed(&self, package: &str) {
        if !self.unregister_app_ops_callback(package) {
            return;
        }
        let mounts = self.registry().mounts();
        for ifs in mounts {
            let mut state = ifs.lock();
            let affected = state
                .stub
                .as_ref()
                .is_some_and(|stub| stub.params().package_name == package);
            if affected {
                if let Err(e) = self.disable_read_logs_locked(&ifs, &mut state) {
                    warn!("failed to disable read logs of mount {}: {e}", ifs.id());
                }
            }
        }
    }

    /// Applies per-uid read timeouts until the mount is loaded or the
    /// longest of them runs out.
    pub(super) fn set_uid_read_timeouts(
        &self,
        storage: StorageId,
        timeouts: &[PerUidReadTimeouts],
    ) {
        let max_pending_us = timeouts
            .iter()
            .map(|t| t.max_pending_time_us)
            .max()
            .unwrap_or_default();
        let max_pending = Duration::from_micros(max_pending_us);
        if max_pending < MIN_PER_UID_TIMEOUT {
            error!(
                "skip setting read timeouts, max pending time {}ms < {}ms",
                max_pending.as_millis(),
                MIN_PER_UID_TIMEOUT.as_millis()
            );
            return;
        }
        let Some(ifs) = self.get_ifs(storage) else {
            error!("setting read timeouts failed, invalid storage {storage}");
            return;
        };
        if let Err(e) = self.deps.incfs.set_uid_read_timeouts(ifs.control(), timeouts) {
            error!("setting read timeouts failed: {e}");
            return;
        }

        let deadline = self.deps.clock.now() + max_pending - PER_UID_TIMEOUT_OFFSET;
        let weak = self.weak_self.clone();
        self.add_ifs_state_callback(
            ifs.id(),
            Box::new(move |storage, ifs_state| {
                let Some(service) = weak.upgrade() else {
                    return false;
                };
                if service.uid_read_timeouts_needed(ifs_state, deadline) {
                    return true;
                }
                if let Some(ifs) = service.get_ifs(storage) {
                    if let Err(e) = service.deps.incfs.set_uid_read_timeouts(ifs.control(), &[]) {
                        warn!("failed to clear read timeouts of mount {storage}: {e}");
                    }
                }
                false
            }),
        );
    }

    fn uid_read_timeouts_needed(&self, ifs_state: IfsState, deadline: Instant) -> bool {
        let now = self.deps.clock.now();
        if now >= deadline || ifs_state.error != 0 {
            return false;
        }
        if ifs_state.fully_loaded && !ifs_state.read_logs_enabled {
            return false;
        }
        deadline - now >= PROGRESS_UPDATE_INTERVAL
    }

    pub(super) fn add_ifs_state_callback(&self, storage: StorageId, callback: IfsStateCallback) {
        if self.ifs_callbacks.add(storage, callback) {
            self.schedule_ifs_state_tick();
        }
    }

    fn schedule_ifs_state_tick(&self) {
        let weak = self.weak_self.clone();
        self.deps.timed_queue.add_job(
            ALL_STORAGES_ID,
            IFS_STATE_INTERVAL,
            Box::new(move || {
                if let Some(service) = weak.upgrade() {
                    service.process_ifs_state_callbacks();
                }
            }),
        );
    }

    fn process_ifs_state_callbacks(&self) {
        if self.ifs_callbacks.process(|storage| self.ifs_state(storage)) {
            self.schedule_ifs_state_tick();
        }
    }

    fn ifs_state(&self, storage: StorageId) -> IfsState {
        let Some(ifs) = self.get_ifs(storage) else {
            return IfsState {
                error: IncrementalError::StorageNotFound(storage).code(),
                ..Default::default()
            };
        };
        match self.deps.incfs.is_everything_fully_loaded(ifs.control()) {
            Ok(LoadingState::Full) => IfsState {
                fully_loaded: true,
                read_logs_enabled: ifs.lock().read_logs_enabled(),
                error: 0,
            },
            Ok(LoadingState::MissingBlocks) => IfsState::default(),
            Err(e) => IfsState {
                error: -(e as i32),
                ..Default::default()
            },
        }
    }

    /// Reports loading progress of `storage` every second until it is
    /// fully loaded.
    pub fn register_loading_progress_listener(
        &self,
        storage: StorageId,
        listener: Arc<dyn LoadingProgressListener>,
    ) -> bool {
        self.update_loading_progress(storage, listener)
    }

    pub fn unregister_loading_progress_listener(&self, storage: StorageId) -> bool {
        self.deps.progress_queue.remove_jobs(storage);
        true
    }

    fn update_loading_progress(
        &self,
        storage: StorageId,
        listener: Arc<dyn LoadingProgressListener>,
    ) -> bool {
        let progress = match self.get_loading_progress(storage) {
            Ok(progress) => progress,
            Err(e) => {
                debug!("stopping progress updates of storage {storage}: {e}");
                return false;
            }
        };
        listener.on_storage_loading_progress_changed(storage, progress.progress());
        if progress.fully_loaded() {
            return true;
        }
        let weak = self.weak_self.clone();
        self.deps.progress_queue.add_job(
            storage,
            PROGRESS_UPDATE_INTERVAL,
            Box::new(move || {
                if let Some(service) = weak.upgrade() {
                    service.update_loading_progress(storage, listener);
                }
            }),
        );
        true
    }

    pub fn register_storage_health_listener(
        &self,
        storage: StorageId,
        params: HealthCheckParams,
        listener: Arc<dyn StorageHealthListener>,
    ) -> bool {
        self.set_health_listener(storage, params, Some(listener))
    }

    pub fn unregister_storage_health_listener(&self, storage: StorageId) {
        self.set_health_listener(storage, HealthCheckParams::default(), None);
    }

    fn set_health_listener(
        &self,
        storage: StorageId,
        params: HealthCheckParams,
        listener: Option<Arc<dyn StorageHealthListener>>,
    ) -> bool {
        let Some(stub) = self.get_ifs(storage).and_then(|ifs| ifs.lock().stub.clone()) else {
            return false;
        };
        stub.set_health_listener(params, listener);
        true
    }

    /// Starts the loaders that still have work once the system is up. Runs
    /// only once.
    pub fn on_system_ready(&self) {
        if self.system_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        let mounts = self.registry().mounts();
        let stubs: Vec<Arc<DataLoaderStub>> = mounts
            .into_iter()
            .filter_map(|ifs| {
                let stub = ifs.lock().stub.clone()?;
                let pending = stub.is_system_data_loader()
                    || matches!(
                        self.deps.incfs.is_everything_fully_loaded(ifs.control()),
                        Ok(LoadingState::MissingBlocks)
                    );
                pending.then_some(stub)
            })
            .collect();
        info!("system ready, starting {} data loaders", stubs.len());
        for stub in stubs {
            stub.request_start();
        }
    }
}
