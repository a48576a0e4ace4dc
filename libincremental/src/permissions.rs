use std::sync::Arc;

/// App-op id of usage stats access.
pub const GET_USAGE_STATS_OP: i32 = 43;

pub trait AppOpsCallback: Send + Sync {
    fn op_changed(&self, op: i32, package: &str);
}

#[cfg_attr(test, mockall::automock)]
pub trait AppOps: Send + Sync {
    /// Checks `permission` for `package`, also noting `operation` when given.
    fn check_permission(
        &self,
        permission: &str,
        operation: Option<&'static str>,
        package: &str,
    ) -> bool;

    fn start_watching_mode(&self, op: i32, package: &str, callback: Arc<dyn AppOpsCallback>);

    fn stop_watching_mode(&self, callback: Arc<dyn AppOpsCallback>);
}
