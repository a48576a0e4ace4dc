//! The incremental filesystem service.
//!
//! [`IncrementalService`] owns the mount registry, one data loader stub per
//! mount and the background machinery (job processor, event loop thread and
//! timed queues). Operations are split by concern across the submodules.

mod connector;
mod files;
mod loading;
mod metrics;
mod native;
mod recovery;
mod storage;


pub use connector::IncrementalServiceConnector;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::archive::ArchiveReader;
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::error::{IncrementalError, Result};
use crate::fs::FsWalker;
use crate::incfs::IncFs;
use crate::jobs::{IfsStateCallbacks, JobProcessor, Looper, TimedQueue};
use crate::loader::DataLoaderManager;
use crate::mount::IncFsMount;
use crate::mounter::MountService;
use crate::permissions::AppOps;
use crate::registry::Registry;
use crate::types::StorageId;

use self::loading::AppOpsListener;

/// Collaborators the service drives.
#[derive(Clone)]
pub struct ServiceDeps {
    pub mounter: Arc<dyn MountService>,
    pub data_loader_manager: Arc<dyn DataLoaderManager>,
    pub incfs: Arc<dyn IncFs>,
    pub app_ops: Arc<dyn AppOps>,
    pub clock: Arc<dyn Clock>,
    pub fs: Arc<dyn FsWalker>,
    pub looper: Arc<dyn Looper>,
    /// Backoff retries, read-log expiry, health rechecks and the mount
    /// state tick.
    pub timed_queue: Arc<dyn TimedQueue>,
    /// Loading progress reports.
    pub progress_queue: Arc<dyn TimedQueue>,
    pub archive_reader: Arc<dyn ArchiveReader>,
}

pub struct IncrementalService {
    root: String,
    config: ServiceConfig,
    deps: ServiceDeps,
    registry: Mutex<Registry>,
    /// Serializes calls into the mount primitive.
    mount_op_lock: Mutex<()>,
    ifs_callbacks: Arc<IfsStateCallbacks>,
    app_ops_callbacks: Mutex<HashMap<String, Arc<AppOpsListener>>>,
    jobs: JobProcessor,
    looper_running: Arc<AtomicBool>,
    looper_thread: Mutex<Option<JoinHandle<()>>>,
    system_ready: AtomicBool,
    weak_self: Weak<IncrementalService>,
}

impl IncrementalService {
    /// Starts the service over the incremental root dir `root` and brings
    /// back the mounts left there by a previous instance.
    pub fn new(root: &str, config: ServiceConfig, deps: ServiceDeps) -> Result<Arc<Self>> {
        let jobs = JobProcessor::start("incfs-jobs")?;
        let looper_running = Arc::new(AtomicBool::new(true));
        let looper_thread = {
            let looper = deps.looper.clone();
            let running = looper_running.clone();
            thread::Builder::new()
                .name("incfs-looper".to_string())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        if let Err(e) = looper.poll_all(None) {
                            warn!("looper poll failed: {e}");
                        }
                    }
                    debug!("looper thread exiting");
                })?
        };

        let service = Arc::new_cyclic(|weak_self| IncrementalService {
            root: root.to_string(),
            config,
            deps,
            registry: Mutex::new(Registry::default()),
            mount_op_lock: Mutex::new(()),
            ifs_callbacks: Arc::new(IfsStateCallbacks::default()),
            app_ops_callbacks: Mutex::new(HashMap::new()),
            jobs,
            looper_running,
            looper_thread: Mutex::new(Some(looper_thread)),
            system_ready: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let adopted = service.adopt_mounted_instances();
        service.mount_existing_images(&adopted);
        info!(
            "incremental service started at {} with {} mounts",
            service.root,
            service.registry().mounts().len()
        );
        Ok(service)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mount_op_lock(&self) -> MutexGuard<'_, ()> {
        self.mount_op_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_ifs(&self, storage: StorageId) -> Option<Arc<IncFsMount>> {
        self.registry().get(storage)
    }

    fn require_ifs(&self, storage: StorageId) -> Result<Arc<IncFsMount>> {
        self.get_ifs(storage)
            .ok_or(IncrementalError::StorageNotFound(storage))
    }
}

impl Drop for IncrementalService {
    fn drop(&mut self) {
        self.jobs.stop();
        self.looper_running.store(false, Ordering::Relaxed);
        self.deps.looper.wake();
        let thread = self
            .looper_thread
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("looper thread panicked");
            }
        }
        self.deps.timed_queue.stop();
        self.deps.progress_queue.stop();
        // mounts go away while the collaborators are still alive
        let mounts = self
            .registry
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        drop(mounts);
    }
}
