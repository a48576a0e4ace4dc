use std::sync::Weak;

use tracing::warn;

use super::IncrementalService;
use crate::error::{IncrementalError, Result};
use crate::types::{StorageId, StreamStatus};

/// Handle a data loader gets to call back into the service for its mount.
///
/// Holds the service weakly: a loader outliving the service just gets errors.
pub struct IncrementalServiceConnector {
    service: Weak<IncrementalService>,
    storage: StorageId,
}

impl IncrementalServiceConnector {
    pub(crate) fn new(service: Weak<IncrementalService>, storage: StorageId) -> Self {
        Self { service, storage }
    }

    pub fn storage(&self) -> StorageId {
        self.storage
    }

    pub fn set_storage_params(&self, enable_read_logs: bool) -> Result<()> {
        let service = self
            .service
            .upgrade()
            .ok_or(IncrementalError::StorageNotFound(self.storage))?;
        service.set_storage_params(self.storage, enable_read_logs)
    }

    /// Forwards the loader's own view of its data stream to the health monitor.
    pub fn report_stream_health(&self, status: StreamStatus) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let Some(ifs) = service.get_ifs(self.storage) else {
            warn!("stream health for unknown storage {}", self.storage);
            return;
        };
        let stub = ifs.lock().stub.clone();
        if let Some(stub) = stub {
            stub.report_stream_health(status);
        }
    }
}
