use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Set of I/O channels controlling one mounted incremental filesystem.
///
/// The channels are owned; handing them to another party is done through
/// [`Control::duplicate`], which never transfers the originals.
#[derive(Debug)]
pub struct Control {
    cmd: OwnedFd,
    pending_reads: OwnedFd,
    logs: Option<OwnedFd>,
    blocks_written: Option<OwnedFd>,
}

impl Control {
    pub fn new(
        cmd: OwnedFd,
        pending_reads: OwnedFd,
        logs: Option<OwnedFd>,
        blocks_written: Option<OwnedFd>,
    ) -> Self {
        Self {
            cmd,
            pending_reads,
            logs,
            blocks_written,
        }
    }

    pub fn cmd(&self) -> BorrowedFd<'_> {
        self.cmd.as_fd()
    }

    pub fn pending_reads(&self) -> BorrowedFd<'_> {
        self.pending_reads.as_fd()
    }

    pub fn pending_reads_raw(&self) -> RawFd {
        self.pending_reads.as_raw_fd()
    }

    pub fn logs(&self) -> Option<BorrowedFd<'_>> {
        self.logs.as_ref().map(AsFd::as_fd)
    }

    pub fn blocks_written(&self) -> Option<BorrowedFd<'_>> {
        self.blocks_written.as_ref().map(AsFd::as_fd)
    }

    /// Duplicates every channel. The copies stay valid after `self` is dropped.
    pub fn duplicate(&self) -> io::Result<Control> {
        Ok(Control {
            cmd: self.cmd.try_clone()?,
            pending_reads: self.pending_reads.try_clone()?,
            logs: self.logs.as_ref().map(OwnedFd::try_clone).transpose()?,
            blocks_written: self
                .blocks_written
                .as_ref()
                .map(OwnedFd::try_clone)
                .transpose()?,
        })
    }
}
