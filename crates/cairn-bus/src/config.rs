use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the [`TaskManager`](crate::TaskManager) pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of jobs executing at the same time.
    pub worker_threads: usize,
    /// Name given to pool threads.
    pub thread_name: String,
    /// How long `stop` waits for queued and running jobs, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            thread_name: "cairn-worker".to_string(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
