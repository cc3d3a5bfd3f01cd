//! Worker selection and resource-box sizing (spec §4.4).

use std::collections::HashSet;

use crate::category::Category;
use crate::resource::ResourceBox;
use crate::task::{ResourceRequestMode, Task};
use crate::worker::{Worker, WorkerHandle, WorkerRegistry};

/// Worker-selection tie-break policy (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPolicy {
    #[default]
    Fcfs,
    Files,
    Time,
    WorstFit,
    Random,
}

fn admits_task(w: &Worker, task: &Task, required_features: &HashSet<String>) -> bool {
    if w.resources.workers.total < 1 {
        return false;
    }
    let req = &task.def.resources_requested;
    if let Some(cores) = req.cores {
        if cores > w.resources.cores.largest {
            return false;
        }
    }
    if let Some(mem) = req.memory {
        if mem > w.resources.memory.largest {
            return false;
        }
    }
    if let Some(disk) = req.disk {
        if disk > w.resources.disk.largest {
            return false;
        }
    }
    if let Some(gpus) = req.gpus {
        if gpus > w.resources.gpus.largest {
            return false;
        }
    }
    required_features.iter().all(|f| w.features.contains(f))
}

/// Picks the first/best worker that is not blocklisted, has at least one
/// worker-slot, can fit the task's minimum resources, and carries every
/// required feature (spec §4.4). Within a policy, iteration order is
/// deterministic given the registry's current contents.
pub fn choose_worker(
    registry: &WorkerRegistry,
    task: &Task,
    policy: SchedulerPolicy,
    required_features: &HashSet<String>,
) -> Option<WorkerHandle> {
    let mut candidates: Vec<&Worker> = registry
        .iter()
        .filter(|w| admits_task(w, task, required_features))
        .collect();

    if candidates.is_empty() {
        return None;
    }

    match policy {
        SchedulerPolicy::Fcfs => {}
        SchedulerPolicy::Files => {
            candidates.sort_by_key(|w| std::cmp::Reverse(w.current_files.len()));
        }
        SchedulerPolicy::Time => {
            candidates.sort_by_key(|w| w.start_time_us);
        }
        SchedulerPolicy::WorstFit => {
            candidates.sort_by_key(|w| std::cmp::Reverse(w.resources.cores.largest - w.resources.cores.inuse));
        }
        SchedulerPolicy::Random => {
            let seed = task.taskid.wrapping_mul(2654435761);
            let idx = (xorshift(seed) as usize) % candidates.len();
            return Some(candidates[idx].handle);
        }
    }

    candidates.first().map(|w| w.handle)
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Implements the four-step `choose_resources` algorithm (spec §4.4).
pub fn choose_resources(worker: &Worker, task: &Task, category: &Category, force_proportional: bool) -> ResourceBox {
    let max = category.dynamic_max(task);
    let largest = &worker.resources;

    // Step 2: proportional carve-up for FIXED categories (or when forced).
    let proportional = matches!(category.allocation_mode, crate::category::AllocationMode::Fixed) || force_proportional;
    if proportional {
        let mut ratios = Vec::new();
        if let Some(c) = max.cores {
            if largest.cores.largest > 0 {
                ratios.push(c as f64 / largest.cores.largest as f64);
            }
        }
        if let Some(m) = max.memory {
            if largest.memory.largest > 0 {
                ratios.push(m as f64 / largest.memory.largest as f64);
            }
        }
        if let Some(d) = max.disk {
            if largest.disk.largest > 0 {
                ratios.push(d as f64 / largest.disk.largest as f64);
            }
        }
        if let Some(g) = max.gpus {
            if largest.gpus.largest > 0 {
                ratios.push(g as f64 / largest.gpus.largest as f64);
            }
        }

        if let Some(&p) = ratios.iter().fold(None, |acc: Option<&f64>, r| match acc {
            Some(a) if a >= r => Some(a),
            _ => Some(r),
        }) {
            if p <= 1.0 {
                // Round p up so 1/p divides evenly into whole tasks per worker.
                let tasks_per_worker = (1.0 / p).floor().max(1.0);
                let p_rounded = 1.0 / tasks_per_worker;
                let has_gpus = max.gpus.unwrap_or(0) > 0;

                let dim = |spec: Option<u64>, worker_largest: u64| -> u64 {
                    spec.unwrap_or_else(|| ((worker_largest as f64) * p_rounded).floor().max(1.0) as u64)
                };

                let mut box_ = ResourceBox {
                    cores: if has_gpus { 0 } else { dim(max.cores, largest.cores.largest) },
                    memory: dim(max.memory, largest.memory.largest),
                    disk: dim(max.disk, largest.disk.largest),
                    gpus: if has_gpus { dim(max.gpus, largest.gpus.largest) } else { 0 },
                    wall_time: max.wall_time.unwrap_or(0),
                    end_time: max.end.unwrap_or(0).max(0) as u64,
                };
                box_ = category.clamp_to_min(box_);
                return box_;
            }
            // p > 1: fall through to "use whole worker".
        }
    }

    // Step 3: all dims unspecified, or a specified dim meets/exceeds the
    // worker's own largest — take the whole worker.
    let all_unspecified = max.cores.is_none() && max.memory.is_none() && max.disk.is_none() && max.gpus.is_none();
    let any_exceeds = max.cores.is_some_and(|v| v >= largest.cores.largest)
        || max.memory.is_some_and(|v| v >= largest.memory.largest)
        || max.disk.is_some_and(|v| v >= largest.disk.largest)
        || max.gpus.is_some_and(|v| v >= largest.gpus.largest);

    let box_ = if all_unspecified || any_exceeds {
        let has_gpus = max.gpus.unwrap_or(0) > 0;
        ResourceBox {
            cores: if has_gpus { 0 } else { max.cores.unwrap_or(largest.cores.largest) },
            memory: max.memory.unwrap_or(largest.memory.largest),
            disk: max.disk.unwrap_or(largest.disk.largest),
            gpus: max.gpus.unwrap_or(largest.gpus.largest),
            wall_time: max.wall_time.unwrap_or(0),
            end_time: max.end.unwrap_or(0).max(0) as u64,
        }
    } else {
        ResourceBox {
            cores: max.cores.unwrap_or(1),
            memory: max.memory.unwrap_or(1),
            disk: max.disk.unwrap_or(1),
            gpus: max.gpus.unwrap_or(0),
            wall_time: max.wall_time.unwrap_or(0),
            end_time: max.end.unwrap_or(0).max(0) as u64,
        }
    };

    // Step 4: clamp up to the category minimum.
    category.clamp_to_min(box_)
}

/// `resource_request == MAX` always asks for the whole worker regardless
/// of what the task specified on the unspecified dims (spec §3).
pub fn apply_resource_request_mode(mut box_: ResourceBox, worker: &Worker, task: &Task) -> ResourceBox {
    if task.def.resource_request == ResourceRequestMode::Max {
        box_.cores = worker.resources.cores.largest;
        box_.memory = worker.resources.memory.largest;
        box_.disk = worker.resources.disk.largest;
        box_.gpus = worker.resources.gpus.largest;
    }
    box_
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceModel;
    use crate::task::TaskDefinition;

    fn worker_with(cores: u64, memory: u64) -> Worker {
        let mut reg = WorkerRegistry::new();
        let h = reg.accept_new("h".to_string(), "h", 0).unwrap();
        let w = reg.lookup_mut(h).unwrap();
        w.resources.workers = ResourceModel::new(1, 1, 1);
        w.resources.cores = ResourceModel::new(cores, cores, cores);
        w.resources.memory = ResourceModel::new(memory, memory, memory);
        w.resources.disk = ResourceModel::new(40960, 40960, 40960);
        w.clone()
    }

    #[test]
    fn whole_worker_when_everything_unspecified() {
        let worker = worker_with(8, 8192);
        let cat = Category::new("default");
        let task = Task::new(1, TaskDefinition::default(), 0);
        let box_ = choose_resources(&worker, &task, &cat, false);
        assert_eq!(box_.cores, 8);
        assert_eq!(box_.memory, 8192);
    }

    #[test]
    fn clamps_up_to_category_minimum() {
        let worker = worker_with(8, 8192);
        let mut cat = Category::new("default");
        cat.min.cores = Some(4);
        let mut def = TaskDefinition::default();
        def.resources_requested.cores = Some(1);
        let task = Task::new(1, def, 0);
        let box_ = choose_resources(&worker, &task, &cat, false);
        assert_eq!(box_.cores, 4);
    }

    #[test]
    fn choose_worker_rejects_missing_feature() {
        let mut reg = WorkerRegistry::new();
        let h = reg.accept_new("h".to_string(), "h", 0).unwrap();
        reg.lookup_mut(h).unwrap().resources.workers = ResourceModel::new(1, 1, 1);
        let task = Task::new(1, TaskDefinition::default(), 0);
        let mut required = HashSet::new();
        required.insert("gpu-v2".to_string());
        assert!(choose_worker(&reg, &task, SchedulerPolicy::Fcfs, &required).is_none());
    }
}
