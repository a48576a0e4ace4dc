use nix::errno::Errno;

use crate::control::Control;

/// Privileged mount operations performed on behalf of the service.
pub trait MountService: Send + Sync {
    /// Mounts a new incremental filesystem from `backing_dir` onto `target_dir`
    /// and returns its control channels.
    fn mount_incfs(
        &self,
        backing_dir: &str,
        target_dir: &str,
        metrics_key: &str,
    ) -> Result<Control, Errno>;

    fn unmount_incfs(&self, dir: &str) -> Result<(), Errno>;

    fn bind_mount(&self, source: &str, target: &str) -> Result<(), Errno>;

    fn set_incfs_mount_options(
        &self,
        control: Control,
        enable_read_logs: bool,
        enable_read_timeouts: bool,
        metrics_key: &str,
    ) -> Result<(), Errno>;
}
