//! Per-category allocation policy and statistics (spec §3 Category, §9
//! "category allocation is a pure function of (category state, task,
//! current_max_worker)").

use std::collections::HashMap;

use crate::resource::ResourceBox;
use crate::task::{ResourceSpec, Task};

#[cfg(test)]
use crate::task::TaskDefinition;

/// Allocation policy a category uses when sizing a task's resource box
/// (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// Every task in the category gets exactly the same box.
    Fixed,
    /// Always hand out the category's max bound.
    Max,
    #[default]
    MinWaste,
    MaxThroughput,
}

/// Running totals used to derive `average_task_time` for fast-abort
/// (spec §4.7: "once ≥10 tasks have completed, maintain
/// average_task_time = (exec_good + send_good + recv_good) / tasks_done").
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryStats {
    pub tasks_done: u64,
    pub total_exec_good: f64,
    pub total_send_good: f64,
    pub total_recv_good: f64,
}

impl CategoryStats {
    pub fn record_good(&mut self, exec_s: f64, send_s: f64, recv_s: f64) {
        self.tasks_done += 1;
        self.total_exec_good += exec_s;
        self.total_send_good += send_s;
        self.total_recv_good += recv_s;
    }

    /// `None` until at least 10 tasks have completed (spec §4.7).
    pub fn average_task_time(&self) -> Option<f64> {
        if self.tasks_done < 10 {
            return None;
        }
        Some((self.total_exec_good + self.total_send_good + self.total_recv_good) / self.tasks_done as f64)
    }
}

/// The outcome of asking a category whether a resource-exhausted task
/// deserves another, larger attempt (spec §4.7, §7 "resource exhaustion").
#[derive(Debug, Clone, Copy)]
pub enum NextLabel {
    Retry(ResourceBox),
    /// The category has nothing bigger to offer; the task stays failed
    /// with whatever result it already carries (spec §8 scenario S3 ends
    /// DONE/RESOURCE_EXHAUSTION, not a separate error outcome).
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub min: ResourceSpec,
    pub max: ResourceSpec,
    pub first: ResourceSpec,
    pub allocation_mode: AllocationMode,
    pub stats: CategoryStats,
    /// `>0` enabled (the multiplier itself), `0` disabled, `<0` use the
    /// manager-wide default (spec §3).
    pub fast_abort_multiplier: f64,
    pub max_resources_seen: ResourceBox,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: ResourceSpec::default(),
            max: ResourceSpec::default(),
            first: ResourceSpec::default(),
            allocation_mode: AllocationMode::default(),
            stats: CategoryStats::default(),
            fast_abort_multiplier: -1.0,
            max_resources_seen: ResourceBox::default(),
        }
    }

    pub fn note_resources_seen(&mut self, b: ResourceBox) {
        self.max_resources_seen.cores = self.max_resources_seen.cores.max(b.cores);
        self.max_resources_seen.memory = self.max_resources_seen.memory.max(b.memory);
        self.max_resources_seen.disk = self.max_resources_seen.disk.max(b.disk);
        self.max_resources_seen.gpus = self.max_resources_seen.gpus.max(b.gpus);
    }

    /// Step 1 of `choose_resources` (spec §4.4): the task's own request
    /// wins on any dimension it specifies; otherwise fall back to the
    /// category's max bound, leaving the dimension unresolved if neither
    /// says anything (the scheduler fills the rest from the worker).
    pub fn dynamic_max(&self, task: &Task) -> ResourceSpec {
        let req = &task.def.resources_requested;
        ResourceSpec {
            cores: req.cores.or(self.max.cores),
            memory: req.memory.or(self.max.memory),
            disk: req.disk.or(self.max.disk),
            gpus: req.gpus.or(self.max.gpus),
            end: req.end,
            wall_time: req.wall_time.or(self.max.wall_time),
            start: req.start,
        }
    }

    /// Clamp a computed box up to the category's minimum (step 4 of
    /// `choose_resources`, spec §4.4).
    pub fn clamp_to_min(&self, mut b: ResourceBox) -> ResourceBox {
        if let Some(min) = self.min.cores {
            b.cores = b.cores.max(min);
        }
        if let Some(min) = self.min.memory {
            b.memory = b.memory.max(min);
        }
        if let Some(min) = self.min.disk {
            b.disk = b.disk.max(min);
        }
        if let Some(min) = self.min.gpus {
            b.gpus = b.gpus.max(min);
        }
        b
    }

    /// Doubles each dimension of `last_box` (floored at 1 so a zero
    /// dimension can still grow), capped at the category's max bound when
    /// one is set. Returns `GiveUp` once doubling makes no further progress
    /// on every bounded dimension (spec §4.7, §7).
    pub fn next_label(&self, last_box: ResourceBox) -> NextLabel {
        let grow = |current: u64, bound: Option<u64>| -> u64 {
            let doubled = (current.max(1)) * 2;
            match bound {
                Some(b) => doubled.min(b),
                None => doubled,
            }
        };

        let candidate = ResourceBox {
            cores: grow(last_box.cores, self.max.cores),
            memory: grow(last_box.memory, self.max.memory),
            disk: grow(last_box.disk, self.max.disk),
            gpus: grow(last_box.gpus, self.max.gpus),
            wall_time: last_box.wall_time,
            end_time: last_box.end_time,
        };

        if candidate.cores <= last_box.cores
            && candidate.memory <= last_box.memory
            && candidate.disk <= last_box.disk
            && candidate.gpus <= last_box.gpus
        {
            NextLabel::GiveUp
        } else {
            NextLabel::Retry(candidate)
        }
    }
}

#[derive(Debug, Default)]
pub struct CategoryTable {
    categories: HashMap<String, Category>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self {
            categories: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Category {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Category> {
        self.categories.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_task_time_requires_ten_samples() {
        let mut stats = CategoryStats::default();
        for _ in 0..9 {
            stats.record_good(1.0, 0.1, 0.1);
        }
        assert!(stats.average_task_time().is_none());
        stats.record_good(1.0, 0.1, 0.1);
        assert!(stats.average_task_time().is_some());
    }

    #[test]
    fn next_label_caps_at_category_max_then_gives_up() {
        let mut cat = Category::new("default");
        cat.max.cores = Some(4);
        cat.max.memory = Some(8192);

        let b1 = ResourceBox {
            cores: 1,
            memory: 1024,
            ..Default::default()
        };
        let label = cat.next_label(b1);
        let grown = match label {
            NextLabel::Retry(b) => b,
            NextLabel::GiveUp => panic!("expected growth room"),
        };
        assert_eq!(grown.cores, 2);
        assert_eq!(grown.memory, 2048);

        let at_max = ResourceBox {
            cores: 4,
            memory: 8192,
            ..Default::default()
        };
        assert!(matches!(cat.next_label(at_max), NextLabel::GiveUp));
    }

    #[test]
    fn dynamic_max_prefers_task_request_over_category_bound() {
        let mut cat = Category::new("default");
        cat.max.cores = Some(8);
        let mut task = Task::new(1, TaskDefinition::default(), 0);
        task.def.resources_requested.cores = Some(2);
        let max = cat.dynamic_max(&task);
        assert_eq!(max.cores, Some(2));
    }
}
