//! Per-mount data loader connection: the status state machine, bind backoff
//! and pending-read health monitoring.

pub mod backoff;
pub mod health;

use std::io::Write;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::constants::{BIND_RETRY_INTERVAL, DESTROY_TIMEOUT, SYSTEM_PACKAGE, USER_STATUS_DELAY};
use crate::control::Control;
use crate::incfs::{IncFs, WaitResult};
use crate::jobs::{IfsStateCallbacks, Looper, TimedQueue};
use crate::loader::{
    DataLoaderManager, DataLoaderStatusListener, FileSystemControl, StorageHealthListener,
};
use crate::service::IncrementalServiceConnector;
use crate::types::{
    DataLoaderParams, DataLoaderStatus, HealthCheckParams, HealthStatus, INVALID_STORAGE_ID,
    MetricValue, Metrics, MountId, PendingRead, StreamStatus, metric_keys,
};

use self::backoff::{BindBackoff, BindDecision};
use self::health::HealthBase;

/// Shared collaborators a stub drives.
#[derive(Clone)]
pub struct StubContext {
    pub manager: Arc<dyn DataLoaderManager>,
    pub incfs: Arc<dyn IncFs>,
    pub looper: Arc<dyn Looper>,
    pub timed_queue: Arc<dyn TimedQueue>,
    pub clock: Arc<dyn Clock>,
    pub ifs_callbacks: Arc<IfsStateCallbacks>,
}

/// Everything a new stub is built from.
pub struct StubParams {
    pub id: MountId,
    pub params: DataLoaderParams,
    pub control: Control,
    pub connector: Arc<IncrementalServiceConnector>,
    pub status_listener: Option<Arc<dyn DataLoaderStatusListener>>,
    pub health_check: HealthCheckParams,
    pub health_listener: Option<Arc<dyn StorageHealthListener>>,
    pub health_path: String,
}

struct StubState {
    id: MountId,
    params: DataLoaderParams,
    control: Option<Control>,
    connector: Option<Arc<IncrementalServiceConnector>>,
    status_listener: Option<Arc<dyn DataLoaderStatusListener>>,
    health_listener: Option<Arc<dyn StorageHealthListener>>,
    health_check: HealthCheckParams,
    health_path: String,
    health_control: Option<Control>,
    registered_fd: Option<RawFd>,
    current: DataLoaderStatus,
    current_ts: Instant,
    target: DataLoaderStatus,
    target_ts: Instant,
    backoff: BindBackoff,
    health_base: Option<HealthBase>,
    last_pending_reads: Vec<PendingRead>,
    health_status: HealthStatus,
    stream_status: StreamStatus,
}

impl StubState {
    fn set_target(&mut self, status: DataLoaderStatus, now: Instant) {
        self.target = status;
        self.target_ts = now;
    }

    fn oldest_pending_read_ts(&self) -> Option<u64> {
        self.last_pending_reads
            .iter()
            .map(|read| read.boot_clock_ts_us)
            .min()
    }
}

/// Connection to the data loader of one mount.
///
/// The stub tracks the last confirmed status of the loader and the status
/// its owner wants, and issues bind/create/start/destroy requests until they
/// match. Transition steps never nest: a step requested while another is in
/// progress is picked up by the running one.
pub struct DataLoaderStub {
    ctx: StubContext,
    state: Mutex<StubState>,
    status_changed: Condvar,
    stepping: AtomicBool,
    step_requested: AtomicBool,
    weak_self: Weak<DataLoaderStub>,
}

impl DataLoaderStub {
    pub fn new(ctx: StubContext, init: StubParams) -> Arc<Self> {
        let now = ctx.clock.now();
        let mut health_listener = init.health_listener;
        let mut health_check = init.health_check;
        if health_listener.is_some() && !health_check.is_valid() {
            health_listener = None;
        }
        if health_listener.is_none() {
            // no listener, no advanced health statuses
            health_check = HealthCheckParams::default();
        }
        let stub = Arc::new_cyclic(|weak_self| DataLoaderStub {
            ctx,
            state: Mutex::new(StubState {
                id: init.id,
                params: init.params,
                control: Some(init.control),
                connector: Some(init.connector),
                status_listener: init.status_listener,
                health_listener,
                health_check,
                health_path: init.health_path,
                health_control: None,
                registered_fd: None,
                current: DataLoaderStatus::Destroyed,
                current_ts: now,
                target: DataLoaderStatus::Destroyed,
                target_ts: now,
                backoff: BindBackoff::default(),
                health_base: None,
                last_pending_reads: Vec::new(),
                health_status: HealthStatus::Ok,
                stream_status: StreamStatus::Healthy,
            }),
            status_changed: Condvar::new(),
            stepping: AtomicBool::new(false),
            step_requested: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });
        stub.update_health_status(false);
        stub
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> MountId {
        self.lock().id
    }

    pub fn is_valid(&self) -> bool {
        self.id() != INVALID_STORAGE_ID
    }

    pub fn params(&self) -> DataLoaderParams {
        self.lock().params.clone()
    }

    pub fn is_system_data_loader(&self) -> bool {
        self.lock().params.package_name == SYSTEM_PACKAGE
    }

    pub fn current_status(&self) -> DataLoaderStatus {
        self.lock().current
    }

    pub fn target_status(&self) -> DataLoaderStatus {
        self.lock().target
    }

    pub fn health_status(&self) -> HealthStatus {
        self.lock().health_status
    }

    pub fn request_create(&self) -> bool {
        self.set_target_status(DataLoaderStatus::Created)
    }

    pub fn request_start(&self) -> bool {
        self.set_target_status(DataLoaderStatus::Started)
    }

    pub fn request_destroy(&self) -> bool {
        self.set_target_status(DataLoaderStatus::Destroyed)
    }

    fn set_target_status(&self, status: DataLoaderStatus) -> bool {
        {
            let mut state = self.lock();
            let now = self.ctx.clock.now();
            state.set_target(status, now);
        }
        self.fsm_step()
    }

    /// Releases everything the stub holds and tears the connection down.
    /// Waits a bounded time for the loader to confirm destruction.
    pub fn cleanup_resources(&self) {
        let id = {
            let mut state = self.lock();
            state.health_path.clear();
            self.unregister_from_pending_reads(&mut state);
            state.health_control = None;
            state.id
        };
        if id == INVALID_STORAGE_ID {
            return;
        }
        self.ctx.timed_queue.remove_jobs(id);
        self.ctx.ifs_callbacks.remove(id);

        self.request_destroy();

        let mut state = self.lock();
        state.params = DataLoaderParams::default();
        state.control = None;
        state.connector = None;
        state.health_listener = None;
        let (mut state, timeout) = self
            .status_changed
            .wait_timeout_while(state, DESTROY_TIMEOUT, |s| {
                s.current != DataLoaderStatus::Destroyed
            })
            .unwrap_or_else(|e| e.into_inner());
        if timeout.timed_out() {
            warn!("data loader for mount {id} did not confirm destruction in time");
        }
        state.status_listener = None;
        state.id = INVALID_STORAGE_ID;
    }

    /// Blocks until the loader reaches `status` or `timeout` passes.
    pub fn wait_for_status(&self, status: DataLoaderStatus, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .status_changed
            .wait_timeout_while(state, timeout, |s| s.current != status)
            .unwrap_or_else(|e| e.into_inner());
        state.current == status
    }

    /// Runs transition steps until no further step is requested.
    fn fsm_step(&self) -> bool {
        self.step_requested.store(true, Ordering::SeqCst);
        let mut result = true;
        loop {
            if self.stepping.swap(true, Ordering::SeqCst) {
                return result;
            }
            while self.step_requested.swap(false, Ordering::SeqCst) {
                result = self.step_once();
            }
            self.stepping.store(false, Ordering::SeqCst);
            if !self.step_requested.load(Ordering::SeqCst) {
                return result;
            }
        }
    }

    fn step_once(&self) -> bool {
        let (id, current, target) = {
            let state = self.lock();
            (state.id, state.current, state.target)
        };
        if id == INVALID_STORAGE_ID {
            return false;
        }
        if current == target {
            return true;
        }
        debug!("mount {id}: data loader step {current:?} -> {target:?}");

        use DataLoaderStatus::*;
        match target {
            Destroyed => match current {
                Unavailable | Unrecoverable => {
                    self.destroy();
                    self.compare_and_set_current_status(Some(current), Destroyed);
                    true
                }
                Binding => {
                    self.compare_and_set_current_status(Some(current), Destroyed);
                    true
                }
                _ => self.destroy(),
            },
            Started => match current {
                Created | Stopped => self.start(),
                _ => self.step_towards_created(current),
            },
            Created => self.step_towards_created(current),
            other => {
                error!("mount {id}: invalid target status {other:?}, current {current:?}");
                false
            }
        }
    }

    fn step_towards_created(&self, current: DataLoaderStatus) -> bool {
        use DataLoaderStatus::*;
        match current {
            Unavailable | Unrecoverable => {
                // drop the broken connection, the next step binds again
                self.destroy();
                self.compare_and_set_current_status(Some(current), Destroyed);
                true
            }
            Destroyed | Binding => self.bind(),
            Bound => self.create(),
            _ => true,
        }
    }

    fn listener(&self) -> Option<Arc<dyn DataLoaderStatusListener>> {
        self.weak_self
            .upgrade()
            .map(|stub| stub as Arc<dyn DataLoaderStatusListener>)
    }

    fn bind(&self) -> bool {
        let (id, params, decision) = {
            let mut state = self.lock();
            let now = self.ctx.clock.now();
            let binding_since =
                (state.current == DataLoaderStatus::Binding).then_some(state.current_ts);
            let decision = state.backoff.next(now, binding_since, &mut rand::rng());
            if decision == BindDecision::Retry {
                state.current_ts = now;
            }
            (state.id, state.params.clone(), decision)
        };
        let delay = match decision {
            BindDecision::Wait => {
                debug!(
                    "skipping bind to {} because of pending bind",
                    params.package_name
                );
                return true;
            }
            BindDecision::Retry => Duration::ZERO,
            BindDecision::Bind(delay) => delay,
        };
        if delay > Duration::from_secs(1) {
            info!(
                "delaying bind to {} by {}s for mount {id}",
                params.package_name,
                delay.as_secs()
            );
        }
        let Some(listener) = self.listener() else {
            return false;
        };
        match self
            .ctx
            .manager
            .bind_to_data_loader(id, &params, delay, listener)
        {
            Ok(()) => true,
            Err(e) => {
                let healthy = delay.is_zero();
                error!(
                    "failed to bind a data loader for mount {id}: {e}{}",
                    if healthy { ", retrying" } else { "" }
                );
                if !healthy {
                    return false;
                }
                let weak = self.weak_self.clone();
                self.ctx.timed_queue.add_job(
                    id,
                    BIND_RETRY_INTERVAL,
                    Box::new(move || {
                        if let Some(stub) = weak.upgrade() {
                            stub.fsm_step();
                        }
                    }),
                );
                // not the loader's fault, keep it healthy
                self.set_current_status(DataLoaderStatus::Binding);
                true
            }
        }
    }

    fn create(&self) -> bool {
        let (id, params, control) = {
            let state = self.lock();
            let control = match (&state.control, &state.connector) {
                (Some(control), Some(connector)) => match control.duplicate() {
                    Ok(incremental) => Some(FileSystemControl {
                        incremental,
                        service: connector.clone(),
                    }),
                    Err(e) => {
                        error!("mount {}: failed to duplicate control: {e}", state.id);
                        None
                    }
                },
                _ => None,
            };
            (state.id, state.params.clone(), control)
        };
        let Some(control) = control else {
            return false;
        };
        let Some(loader) = self.ctx.manager.get_data_loader(id) else {
            error!("mount {id}: no data loader to create");
            return false;
        };
        let Some(listener) = self.listener() else {
            return false;
        };
        if let Err(e) = loader.create(id, &params, control, listener) {
            error!("mount {id}: failed to create data loader: {e}");
            return false;
        }
        true
    }

    fn start(&self) -> bool {
        let id = self.id();
        let Some(loader) = self.ctx.manager.get_data_loader(id) else {
            error!("mount {id}: no data loader to start");
            return false;
        };
        if let Err(e) = loader.start(id) {
            error!("mount {id}: failed to start data loader: {e}");
            return false;
        }
        true
    }

    fn destroy(&self) -> bool {
        let id = self.id();
        if let Err(e) = self.ctx.manager.unbind_from_data_loader(id) {
            error!("mount {id}: failed to unbind data loader: {e}");
            return false;
        }
        true
    }

    fn set_current_status(&self, status: DataLoaderStatus) {
        self.compare_and_set_current_status(None, status);
    }

    fn compare_and_set_current_status(
        &self,
        expected: Option<DataLoaderStatus>,
        status: DataLoaderStatus,
    ) {
        let (id, old, target, listener) = {
            let mut state = self.lock();
            if state.current == status {
                return;
            }
            if expected.is_some_and(|e| e != state.current) {
                return;
            }
            let now = self.ctx.clock.now();
            let old = state.current;
            state.current = status;
            state.current_ts = now;
            if matches!(
                status,
                DataLoaderStatus::Unavailable | DataLoaderStatus::Unrecoverable
            ) {
                state.set_target(DataLoaderStatus::Destroyed, now);
            }
            (state.id, old, state.target, state.status_listener.clone())
        };

        info!("mount {id}: data loader status {old:?} -> {status:?} (target {target:?})");

        if let Some(listener) = listener {
            listener.on_status_changed(id, status);
        }
        self.fsm_step();
        self.status_changed.notify_all();
    }

    /// Replaces the health listener. Invalid thresholds or no listener turn
    /// health reporting off.
    pub fn set_health_listener(
        &self,
        params: HealthCheckParams,
        listener: Option<Arc<dyn StorageHealthListener>>,
    ) {
        let mut state = self.lock();
        state.health_check = params;
        state.health_listener = listener;
        if state.health_listener.is_none() {
            state.health_check = HealthCheckParams::default();
        }
    }

    pub fn report_stream_health(&self, status: StreamStatus) {
        self.lock().stream_status = status;
        self.update_health_status(false);
    }

    fn on_health_status(
        &self,
        listener: Option<Arc<dyn StorageHealthListener>>,
        status: HealthStatus,
    ) {
        let id = {
            let mut state = self.lock();
            state.health_status = status;
            state.id
        };
        if let Some(listener) = listener {
            listener.on_health_status(id, status);
        }
    }

    /// Re-evaluates the pending reads. `baseline` re-anchors the kernel clock
    /// and is set when the pending-reads channel signalled new reads.
    pub fn update_health_status(&self, baseline: bool) {
        let (listener, status) = {
            let mut state = self.lock();
            debug!(
                "mount {}: update health status{}",
                state.id,
                if baseline { " (baseline)" } else { "" }
            );
            self.unregister_from_pending_reads(&mut state);
            let listener = state.health_listener.clone();

            let now = self.ctx.clock.now();
            let kernel_ts = self.read_oldest_pending_read_ts(&mut state);
            if baseline {
                state.health_base = kernel_ts.map(|kernel_ts_us| HealthBase {
                    user_ts: now,
                    kernel_ts_us,
                });
            }

            let base = state.health_base.filter(|base| base.user_ts <= now);
            let (Some(kernel_ts), Some(base)) = (kernel_ts, base) else {
                self.register_for_pending_reads(&mut state);
                drop(state);
                self.on_health_status(listener, HealthStatus::Ok);
                return;
            };

            state.health_control = None;
            state.set_target(DataLoaderStatus::Started, now);

            if !state.health_check.is_valid() {
                drop(state);
                self.on_health_status(listener, HealthStatus::ReadsPending);
                self.fsm_step();
                return;
            }

            let elapsed = base.elapsed_since(now, kernel_ts);
            let (status, check_back_after) = health::classify(&state.health_check, elapsed);
            let status = health::degrade(status, state.stream_status);
            debug!(
                "mount {}: {status:?}, next health check in {check_back_after:?}",
                state.id
            );
            let weak = self.weak_self.clone();
            self.ctx.timed_queue.add_job(
                state.id,
                check_back_after,
                Box::new(move || {
                    if let Some(stub) = weak.upgrade() {
                        stub.update_health_status(false);
                    }
                }),
            );
            (listener, status)
        };

        self.on_health_status(listener, status);
        self.fsm_step();
    }

    /// Re-opens the health control if needed and snapshots pending reads.
    fn read_oldest_pending_read_ts(&self, state: &mut StubState) -> Option<u64> {
        if state.health_path.is_empty() {
            state.health_control = None;
            return None;
        }
        if state.health_control.is_none() {
            state.health_control = self.ctx.incfs.open_mount(&state.health_path);
        }
        let Some(control) = state.health_control.as_ref() else {
            error!(
                "mount {}: failed to open health control at {}",
                state.id, state.health_path
            );
            return None;
        };
        let mut reads = Vec::new();
        let result = self
            .ctx
            .incfs
            .wait_for_pending_reads(control, Duration::ZERO, &mut reads);
        if result != WaitResult::HaveData || reads.is_empty() {
            state.last_pending_reads.clear();
            return None;
        }
        state.last_pending_reads = reads;
        state.oldest_pending_read_ts()
    }

    fn register_for_pending_reads(&self, state: &mut StubState) {
        let Some(control) = state.health_control.as_ref() else {
            return;
        };
        let fd = control.pending_reads_raw();
        let weak = self.weak_self.clone();
        self.ctx.looper.add_fd(
            fd,
            Box::new(move |_| {
                if let Some(stub) = weak.upgrade() {
                    stub.update_health_status(true);
                }
                false
            }),
        );
        state.registered_fd = Some(fd);
    }

    fn unregister_from_pending_reads(&self, state: &mut StubState) {
        if let Some(fd) = state.registered_fd.take() {
            self.ctx.looper.remove_fd(fd);
        }
    }

    pub fn metrics(&self, metrics: &mut Metrics) {
        let state = self.lock();
        let now = self.ctx.clock.now();
        if let (Some(base), Some(oldest)) = (state.health_base, state.oldest_pending_read_ts()) {
            if oldest >= base.kernel_ts_us {
                let elapsed = base.elapsed_since(now, oldest);
                metrics.put(
                    metric_keys::MILLIS_SINCE_OLDEST_PENDING_READ,
                    MetricValue::millis(elapsed),
                );
            }
        }
        metrics.put(
            metric_keys::STORAGE_HEALTH_STATUS_CODE,
            MetricValue::Int(state.health_status.code()),
        );
        metrics.put(
            metric_keys::DATA_LOADER_STATUS_CODE,
            MetricValue::Int(state.current.code()),
        );
        if let Some(bind_ts) = state.backoff.previous_bind_ts() {
            metrics.put(
                metric_keys::MILLIS_SINCE_LAST_DATA_LOADER_BIND,
                MetricValue::millis(now.saturating_duration_since(bind_ts)),
            );
        }
        metrics.put(
            metric_keys::DATA_LOADER_BIND_DELAY_MILLIS,
            MetricValue::millis(state.backoff.previous_bind_delay()),
        );
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let state = self.lock();
        let now = self.ctx.clock.now();
        writeln!(out, "    dataLoader: {{")?;
        writeln!(out, "      currentStatus: {:?}", state.current)?;
        writeln!(
            out,
            "      currentStatusTs: {}ms ago",
            now.saturating_duration_since(state.current_ts).as_millis()
        )?;
        writeln!(out, "      targetStatus: {:?}", state.target)?;
        writeln!(
            out,
            "      targetStatusTs: {}ms ago",
            now.saturating_duration_since(state.target_ts).as_millis()
        )?;
        writeln!(out, "      health: {{")?;
        writeln!(out, "        path: {}", state.health_path)?;
        writeln!(
            out,
            "        base: {}",
            state
                .health_base
                .map(|b| format!(
                    "{}ms ago ({}us)",
                    now.saturating_duration_since(b.user_ts).as_millis(),
                    b.kernel_ts_us
                ))
                .unwrap_or_else(|| "none".to_string())
        )?;
        writeln!(out, "        blockedTimeout: {:?}", state.health_check.blocked_timeout)?;
        writeln!(out, "        unhealthyTimeout: {:?}", state.health_check.unhealthy_timeout)?;
        writeln!(
            out,
            "        unhealthyMonitoring: {:?}",
            state.health_check.unhealthy_monitoring
        )?;
        writeln!(out, "        lastPendingReads:")?;
        for read in &state.last_pending_reads {
            writeln!(out, "          fileId: {}", read.id)?;
            writeln!(out, "          blockIndex: {}", read.block)?;
            writeln!(out, "          bootClockTsUs: {}", read.boot_clock_ts_us)?;
        }
        writeln!(
            out,
            "        bind: {}s ago (delay: {}s)",
            state
                .backoff
                .previous_bind_ts()
                .map(|ts| now.saturating_duration_since(ts).as_secs())
                .unwrap_or_default(),
            state.backoff.previous_bind_delay().as_secs()
        )?;
        writeln!(out, "        status: {:?}", state.health_status)?;
        writeln!(out, "      }}")?;
        writeln!(out, "      dataLoaderParams: {{")?;
        writeln!(out, "        type: {:?}", state.params.kind)?;
        writeln!(out, "        packageName: {}", state.params.package_name)?;
        writeln!(out, "        className: {}", state.params.class_name)?;
        writeln!(out, "        arguments: {}", state.params.arguments)?;
        writeln!(out, "      }}")?;
        writeln!(out, "    }}")
    }
}

impl DataLoaderStatusListener for DataLoaderStub {
    fn on_status_changed(&self, mount_id: MountId, status: DataLoaderStatus) {
        let id = self.id();
        if id == INVALID_STORAGE_ID {
            if status == DataLoaderStatus::Bound {
                info!("bound to a destroyed stub of mount {mount_id}, unbinding");
                if let Err(e) = self.ctx.manager.unbind_from_data_loader(mount_id) {
                    warn!("failed to unbind data loader for mount {mount_id}: {e}");
                }
            } else {
                error!("status {status:?} reported to a destroyed stub of mount {mount_id}");
            }
            return;
        }
        if id != mount_id {
            error!("status {status:?} for mount {mount_id} reported to the stub of mount {id}");
            return;
        }
        if matches!(
            status,
            DataLoaderStatus::Unavailable | DataLoaderStatus::Unrecoverable
        ) {
            let weak = self.weak_self.clone();
            self.ctx.timed_queue.add_job(
                id,
                USER_STATUS_DELAY,
                Box::new(move || {
                    if let Some(stub) = weak.upgrade() {
                        stub.set_current_status(status);
                    }
                }),
            );
            return;
        }
        self.set_current_status(status);
    }
}
