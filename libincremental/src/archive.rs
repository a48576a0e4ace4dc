use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    /// Offset of the entry data from the start of the archive file.
    pub data_offset: u64,
    pub compressed_length: u64,
    pub uncompressed_length: u64,
    /// Stored without compression.
    pub stored: bool,
}

pub trait Archive: Send + Sync {
    fn entries(&self, prefix: &str, suffix: &str) -> Vec<ArchiveEntry>;

    fn extract(&self, entry: &ArchiveEntry) -> io::Result<Vec<u8>>;
}

pub trait ArchiveReader: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Arc<dyn Archive>>;
}
