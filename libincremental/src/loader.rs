//! Remote data loader interfaces and the listeners the service reports through.

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;

use crate::control::Control;
use crate::service::IncrementalServiceConnector;
use crate::types::{DataLoaderParams, DataLoaderStatus, HealthStatus, MountId, StorageId};

pub trait DataLoaderStatusListener: Send + Sync {
    fn on_status_changed(&self, id: MountId, status: DataLoaderStatus);
}

pub trait StorageHealthListener: Send + Sync {
    fn on_health_status(&self, storage: StorageId, status: HealthStatus);
}

pub trait LoadingProgressListener: Send + Sync {
    fn on_storage_loading_progress_changed(&self, storage: StorageId, progress: f32);
}

/// What a data loader receives to serve one mount.
pub struct FileSystemControl {
    pub incremental: Control,
    pub service: Arc<IncrementalServiceConnector>,
}

pub trait DataLoader: Send + Sync {
    fn create(
        &self,
        id: MountId,
        params: &DataLoaderParams,
        control: FileSystemControl,
        listener: Arc<dyn DataLoaderStatusListener>,
    ) -> Result<(), Errno>;

    fn start(&self, id: MountId) -> Result<(), Errno>;
}

pub trait DataLoaderManager: Send + Sync {
    /// Asks for a connection to the loader described by `params`. The outcome
    /// arrives through `listener` as `Bound` or `Destroyed`.
    fn bind_to_data_loader(
        &self,
        id: MountId,
        params: &DataLoaderParams,
        bind_delay: Duration,
        listener: Arc<dyn DataLoaderStatusListener>,
    ) -> Result<(), Errno>;

    fn get_data_loader(&self, id: MountId) -> Option<Arc<dyn DataLoader>>;

    fn unbind_from_data_loader(&self, id: MountId) -> Result<(), Errno>;
}
