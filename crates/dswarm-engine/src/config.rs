//! Manager-wide configuration (spec §4.4, §4.7, §6).

use crate::scheduler::SchedulerPolicy;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Expected `dataswarm` handshake protocol version (spec §4.6).
    pub protocol_version: u32,
    /// Overcommit multiplier for cores/memory/gpus (never disk), spec §4.1.
    pub overcommit: f64,
    /// Force the proportional carve-up branch of `choose_resources` for
    /// every category, not just FIXED ones (spec §4.4 step 2).
    pub force_proportional_resources: bool,
    pub scheduler_policy: SchedulerPolicy,
    /// Minimum number of connected workers before the loop will dispatch a
    /// ready task (spec §4.8 step 9).
    pub wait_for_workers: u32,
    /// Default fast-abort multiplier used when a category leaves its own
    /// multiplier unset (`<0`), spec §3.
    pub default_fast_abort_multiplier: f64,
    pub keepalive_interval_s: i64,
    pub keepalive_timeout_s: i64,
    /// Deadline for completing a promised trailing byte payload after a
    /// `result`/`update`/`cache-invalid` header line (spec §5 suspension
    /// point (b)); enforced by `conn::run_reader`.
    pub short_timeout_s: u64,
    pub max_new_workers_per_turn: usize,
    pub catalog_update_interval_s: i64,
    pub resource_measurement_interval_s: i64,
    pub large_task_check_interval_s: i64,
    pub catalog_hosts: Vec<(String, u16)>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            overcommit: 1.0,
            force_proportional_resources: false,
            scheduler_policy: SchedulerPolicy::default(),
            wait_for_workers: 0,
            default_fast_abort_multiplier: 10.0,
            keepalive_interval_s: 120,
            keepalive_timeout_s: 30,
            short_timeout_s: 5,
            max_new_workers_per_turn: 10,
            catalog_update_interval_s: 60,
            resource_measurement_interval_s: 30,
            large_task_check_interval_s: 180,
            catalog_hosts: Vec::new(),
        }
    }
}
