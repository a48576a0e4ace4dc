//! Records persisted inside a mount so it can be rebuilt after a restart.
//!
//! Each record is the metadata of an otherwise empty file created through
//! the storage primitive, encoded as JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::control::Control;
use crate::error::Result;
use crate::incfs::IncFs;
use crate::types::{DataLoaderParams, StorageId};

/// Contents of `<mount>/.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub storage_id: StorageId,
    pub loader: DataLoaderParams,
}

/// Contents of a `<mount>/.mountpoint.<uuid>` file, one per permanent bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRecord {
    pub storage_id: StorageId,
    pub source_subdir: String,
    pub dest_path: String,
}

impl BindRecord {
    pub fn is_complete(&self) -> bool {
        !self.source_subdir.is_empty() && !self.dest_path.is_empty()
    }
}

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Reads and decodes the record stored at `path`. Missing or corrupt
/// records yield `None`.
pub fn read<T: DeserializeOwned>(incfs: &dyn IncFs, control: &Control, path: &str) -> Option<T> {
    let metadata = match incfs.get_metadata_by_path(control, path) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("failed to read record {path}: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&metadata) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("corrupt record {path}: {e}");
            None
        }
    }
}
