use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for scheduler behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Seconds between worker session probes
    pub heartbeat_interval_secs: u64, // Default: 10

    /// Scheduling windows each worker may hold at once
    pub sched_windows: usize, // Default: 2

    /// Bound on selector checks and stat RPC calls, in seconds
    pub selector_timeout_secs: u64, // Default: 5

    /// Grace period for a worker loop to acknowledge closure, in seconds
    pub worker_close_timeout_secs: u64, // Default: 1

    /// Path of the persisted sector-to-group map
    pub group_file: PathBuf,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            sched_windows: 2,
            selector_timeout_secs: 5,
            worker_close_timeout_secs: 1,
            group_file: PathBuf::from("sector_groups.json"),
        }
    }
}

impl SchedConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Session probes time out after half a heartbeat period.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs) / 2
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_secs(self.selector_timeout_secs)
    }

    pub fn worker_close_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_close_timeout_secs)
    }
}
