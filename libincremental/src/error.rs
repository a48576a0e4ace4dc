use nix::errno::Errno;

use crate::types::StorageId;

pub type Result<T> = std::result::Result<T, IncrementalError>;

#[derive(Debug, thiserror::Error)]
pub enum IncrementalError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),

    #[error("invalid mount target: {0}")]
    InvalidMountTarget(String),

    #[error("storage {0} not found")]
    StorageNotFound(StorageId),

    #[error("no storage at {0} and creation was not requested")]
    NotRequested(String),

    #[error("path {0} is already bound")]
    AlreadyBound(String),

    #[error("path {0} is not bound to storage {1}")]
    NotBound(String, StorageId),

    #[error("cannot resolve {0} within storage {1}")]
    Unresolved(String, StorageId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl IncrementalError {
    pub fn sys(op: &'static str, source: Errno) -> Self {
        Self::Sys { op, source }
    }

    /// POSIX error number closest to this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::NotAbsolute(_)
            | Self::InvalidMountTarget(_)
            | Self::StorageNotFound(_)
            | Self::NotBound(..)
            | Self::Unresolved(..)
            | Self::InvalidArgument(_)
            | Self::Json(_)
            | Self::Yaml(_) => Errno::EINVAL,
            Self::NotRequested(_) => Errno::ENOENT,
            Self::AlreadyBound(_) => Errno::EEXIST,
            Self::PermissionDenied(_) => Errno::EPERM,
            Self::Sys { source, .. } => *source,
            Self::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
        }
    }

    /// Negative errno, the form callers across the service boundary expect.
    pub fn code(&self) -> i32 {
        -(self.errno() as i32)
    }
}

impl From<Errno> for IncrementalError {
    fn from(source: Errno) -> Self {
        Self::Sys { op: "syscall", source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_errnos() {
        assert_eq!(IncrementalError::NotAbsolute("x".into()).code(), -libc::EINVAL);
        assert_eq!(IncrementalError::PermissionDenied("x".into()).code(), -libc::EPERM);
        assert_eq!(IncrementalError::sys("mount", Errno::EBUSY).code(), -libc::EBUSY);
        let io = std::io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(IncrementalError::from(io).code(), -libc::ENOTEMPTY);
    }
}
