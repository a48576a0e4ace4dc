use std::time::Duration;

pub const BACKING_DIR: &str = "backing_store";
pub const MOUNT_DIR: &str = "mount";
pub const MOUNT_KEY_PREFIX: &str = "MT_";
pub const STORAGE_PREFIX: &str = "st";
pub const MOUNTPOINT_RECORD_PREFIX: &str = ".mountpoint.";
pub const INFO_RECORD_NAME: &str = ".info";
pub const READ_LOGS_DISABLED_MARKER: &str = ".readlogs_disabled";
pub const INDEX_DIR: &str = ".index";
pub const INCOMPLETE_DIR: &str = ".incomplete";
pub const LIB_DIR: &str = "lib";
pub const LIB_SUFFIX: &str = ".so";
pub const BLOCK_SIZE: usize = 4096;
pub const SYSTEM_PACKAGE: &str = "android";

pub const MAX_MOUNT_DIR_ATTEMPTS: u32 = 1000;
pub const MAX_STORAGE_DIR_ATTEMPTS: u32 = 1024;
pub const MAX_MOUNT_KEY_LEN: usize = 16;

pub const USER_STATUS_DELAY: Duration = Duration::from_millis(100);
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);
pub const IFS_STATE_INTERVAL: Duration = Duration::from_millis(1000);
pub const PER_UID_TIMEOUT_OFFSET: Duration = Duration::from_secs(2);
pub const MIN_PER_UID_TIMEOUT: Duration = Duration::from_secs(3);
pub const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_LOGS_MAX_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

pub const HEALTHY_DATA_LOADER_UPTIME: Duration = Duration::from_secs(10 * 60);
pub const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const BIND_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const BINDING_TIMEOUT: Duration = Duration::from_secs(60);
pub const MIN_BIND_DELAY: Duration = Duration::from_secs(1);
pub const MAX_BIND_DELAY: Duration = Duration::from_secs(10000);
pub const BIND_DELAY_MULTIPLIER: u32 = 10;
pub const BIND_DELAY_JITTER_DIVIDER: u32 = 10;
pub const MIN_CRASH_INTERVAL: Duration = Duration::from_millis(100);

pub const HEALTH_TOLERANCE: Duration = Duration::from_millis(500);
pub const MIN_UNHEALTHY_MONITORING: Duration = Duration::from_millis(1000);

pub const LOADER_USAGE_STATS_PERMISSION: &str = "android.permission.LOADER_USAGE_STATS";
pub const LOADER_USAGE_STATS_OP: &str = "android:loader_usage_stats";
pub const INTERACT_ACROSS_USERS_PERMISSION: &str = "android.permission.INTERACT_ACROSS_USERS";
