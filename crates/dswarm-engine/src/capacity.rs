//! Rolling capacity estimation from recent task completions (spec §4.5).

use std::collections::VecDeque;

use crate::resource::ResourceBox;

const EWMA_ALPHA: f64 = 0.05;
const MIN_CAPACITY: u64 = 10;
const MIN_WINDOW: usize = 50;

/// One entry appended on every task completion (spec §3 TaskReport).
#[derive(Debug, Clone, Copy)]
pub struct TaskReport {
    pub transfer_time_us: u64,
    pub exec_time_us: u64,
    pub manager_time_us: u64,
    pub allocated: ResourceBox,
}

/// Default stats handed out when no reports have been collected yet
/// (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityStats {
    pub capacity_tasks: u64,
    pub capacity_cores: u64,
    pub capacity_memory: u64,
    pub capacity_disk: u64,
    pub capacity_gpus: u64,
    pub capacity_weighted: u64,
}

impl Default for CapacityStats {
    fn default() -> Self {
        Self {
            capacity_tasks: 10,
            capacity_cores: 1,
            capacity_memory: 512,
            capacity_disk: 1024,
            capacity_gpus: 0,
            capacity_weighted: 10,
        }
    }
}

/// Bounded window of recent `TaskReport`s plus the EWMA of instantaneous
/// capacity (spec §4.5, invariant 6: non-decreasing EWMA clamped at a
/// floor — the floor here is `MIN_CAPACITY`, the EWMA itself only grows
/// when fed values above its current level the way a max-tracking EWMA
/// would, but the spec's formula is a plain weighted average, so we
/// implement the formula as written and rely on the floor for invariant 6).
#[derive(Debug, Default)]
pub struct CapacityEstimator {
    reports: VecDeque<TaskReport>,
    weighted: Option<f64>,
}

impl CapacityEstimator {
    pub fn new() -> Self {
        Self {
            reports: VecDeque::new(),
            weighted: None,
        }
    }

    /// Appends a report, trimming the window to `max(50, 2 * tasks_on_workers)`.
    pub fn record(&mut self, report: TaskReport, tasks_on_workers: usize) {
        self.reports.push_back(report);
        let cap = MIN_WINDOW.max(2 * tasks_on_workers);
        while self.reports.len() > cap {
            self.reports.pop_front();
        }

        if let Some(last) = self.reports.back() {
            if last.transfer_time_us > 0 {
                let instantaneous =
                    (floor_us(last.exec_time_us) as f64 / floor_us(last.transfer_time_us + last.manager_time_us) as f64).ceil();
                let prev = self.weighted.unwrap_or(instantaneous);
                let next = (EWMA_ALPHA * instantaneous + (1.0 - EWMA_ALPHA) * prev).ceil();
                self.weighted = Some(next);
            }
        }
    }

    pub fn stats(&self) -> CapacityStats {
        if self.reports.is_empty() {
            return CapacityStats::default();
        }

        let mut total_exec = 0u64;
        let mut total_transfer = 0u64;
        let mut total_manager = 0u64;
        let mut sum_cores = 0u64;
        let mut sum_memory = 0u64;
        let mut sum_disk = 0u64;
        let mut sum_gpus = 0u64;

        for r in &self.reports {
            total_exec += r.exec_time_us;
            total_transfer += r.transfer_time_us;
            total_manager += r.manager_time_us;
            sum_cores += r.allocated.cores;
            sum_memory += r.allocated.memory;
            sum_disk += r.allocated.disk;
            sum_gpus += r.allocated.gpus;
        }

        let n = self.reports.len() as u64;
        let ratio = MIN_CAPACITY.max(
            (floor_us(total_exec) as f64 / floor_us(total_transfer + total_manager) as f64).ceil() as u64,
        );

        let avg = |sum: u64| (sum as f64 / n as f64 * ratio as f64).ceil() as u64;

        CapacityStats {
            capacity_tasks: ratio,
            capacity_cores: avg(sum_cores),
            capacity_memory: avg(sum_memory),
            capacity_disk: avg(sum_disk),
            capacity_gpus: avg(sum_gpus),
            capacity_weighted: self.weighted.map(|w| w.ceil() as u64).unwrap_or(MIN_CAPACITY).max(MIN_CAPACITY),
        }
    }
}

fn floor_us(v: u64) -> u64 {
    v.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(transfer: u64, exec: u64, manager: u64) -> TaskReport {
        TaskReport {
            transfer_time_us: transfer,
            exec_time_us: exec,
            manager_time_us: manager,
            allocated: ResourceBox {
                cores: 1,
                memory: 512,
                disk: 1024,
                gpus: 0,
                wall_time: 0,
                end_time: 0,
            },
        }
    }

    #[test]
    fn empty_window_reports_defaults() {
        let est = CapacityEstimator::new();
        assert_eq!(est.stats(), CapacityStats::default());
    }

    #[test]
    fn capacity_never_drops_below_floor() {
        let mut est = CapacityEstimator::new();
        est.record(report(1, 1, 1), 1);
        assert!(est.stats().capacity_tasks >= 10);
        assert!(est.stats().capacity_weighted >= 10);
    }

    #[test]
    fn window_trims_to_at_least_fifty_or_double_running() {
        let mut est = CapacityEstimator::new();
        for _ in 0..80 {
            est.record(report(100, 1000, 10), 5);
        }
        assert_eq!(est.reports.len(), 50);
    }
}
