// ── Engine configuration ──
//
// Built by `edgesync-config` from TOML/env, or directly in tests.

use std::time::Duration;

use crate::model::{JobOptions, JobPriority};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum devices processed concurrently by one apply.
    pub fanout_concurrency: usize,
    pub job_priority: JobPriority,
    pub job_attempts: u32,
    pub remove_on_complete: bool,
    /// Upper bound on synchronous device round-trips.
    pub device_request_timeout: Duration,
    /// Optimistic-write retries before a device update gives up.
    pub store_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fanout_concurrency: 16,
            job_priority: JobPriority::Normal,
            job_attempts: 1,
            remove_on_complete: true,
            device_request_timeout: Duration::from_secs(30),
            store_retry_limit: 5,
        }
    }
}

impl EngineConfig {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.job_priority,
            attempts: self.job_attempts.max(1),
            remove_on_complete: self.remove_on_complete,
        }
    }
}
