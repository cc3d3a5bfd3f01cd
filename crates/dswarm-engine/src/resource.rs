//! Per-worker resource counters (§4.1) and the concrete per-task allocation
//! ("box", per the GLOSSARY).
//!
//! The four resource kinds are a closed set (cores, memory, disk, gpus) per
//! the design notes in spec.md §9 — this stays a small fixed-layout struct,
//! not a dynamic map keyed by resource name.

use serde::{Deserialize, Serialize};

/// One resource kind tracked per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cores,
    Memory,
    Disk,
    Gpus,
    Workers,
}

impl ResourceKind {
    /// Disk never gets an overcommit multiplier (spec §4.1).
    pub fn overcommittable(self) -> bool {
        !matches!(self, ResourceKind::Disk)
    }
}

/// A single resource counter: total capacity, amount in use, and the
/// smallest/largest single-worker report seen (used to aggregate across a
/// heterogeneous pool). Workers report each of these wholesale in one
/// `resource` line; `inuse` is preserved by the manager across updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceModel {
    pub total: u64,
    pub inuse: u64,
    pub smallest: u64,
    pub largest: u64,
    /// Optional free-form tag set via `resource tag <value>`.
    #[serde(skip)]
    pub tag: Option<String>,
}

impl ResourceModel {
    pub fn new(total: u64, smallest: u64, largest: u64) -> Self {
        Self {
            total,
            inuse: 0,
            smallest,
            largest,
            tag: None,
        }
    }

    /// Applies a worker's `resource <kind> <total> <smallest> <largest>`
    /// update, preserving the previously tracked `inuse` (spec §4.1: "the
    /// manager preserves `inuse` across updates").
    pub fn apply_update(&mut self, total: u64, smallest: u64, largest: u64) {
        self.total = total;
        self.smallest = smallest;
        self.largest = largest;
    }

    /// Aggregates another worker's counter into this running sum: totals and
    /// in-use amounts add, smallest/largest take the componentwise min/max.
    pub fn accumulate(&mut self, other: &ResourceModel) {
        self.total += other.total;
        self.inuse += other.inuse;
        self.smallest = if self.smallest == 0 {
            other.smallest
        } else {
            self.smallest.min(other.smallest)
        };
        self.largest = self.largest.max(other.largest);
    }

    /// Effective admissible total after applying an overcommit multiplier,
    /// which only ever scales cores/memory/gpus (spec §4.1, §9 glossary).
    pub fn admissible_total(&self, kind: ResourceKind, overcommit: f64) -> u64 {
        if kind.overcommittable() && overcommit > 1.0 {
            ((self.total as f64) * overcommit) as u64
        } else {
            self.total
        }
    }
}

/// The four closed resource kinds tracked per worker, fixed layout (spec §9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCounters {
    pub cores: ResourceModel,
    pub memory: ResourceModel,
    pub disk: ResourceModel,
    pub gpus: ResourceModel,
    pub workers: ResourceModel,
}

impl ResourceCounters {
    pub fn get(&self, kind: ResourceKind) -> &ResourceModel {
        match kind {
            ResourceKind::Cores => &self.cores,
            ResourceKind::Memory => &self.memory,
            ResourceKind::Disk => &self.disk,
            ResourceKind::Gpus => &self.gpus,
            ResourceKind::Workers => &self.workers,
        }
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut ResourceModel {
        match kind {
            ResourceKind::Cores => &mut self.cores,
            ResourceKind::Memory => &mut self.memory,
            ResourceKind::Disk => &mut self.disk,
            ResourceKind::Gpus => &mut self.gpus,
            ResourceKind::Workers => &mut self.workers,
        }
    }

    /// Componentwise max against another worker's counters — used to
    /// maintain `current_max_worker` (invariant 7).
    pub fn componentwise_max(&mut self, other: &ResourceCounters) {
        self.cores.largest = self.cores.largest.max(other.cores.largest);
        self.memory.largest = self.memory.largest.max(other.memory.largest);
        self.disk.largest = self.disk.largest.max(other.disk.largest);
        self.gpus.largest = self.gpus.largest.max(other.gpus.largest);
    }
}

/// The concrete resource allocation assigned to one task on one worker
/// (GLOSSARY: "box").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBox {
    pub cores: u64,
    pub memory: u64,
    pub disk: u64,
    pub gpus: u64,
    pub wall_time: u64,
    pub end_time: u64,
}

impl ResourceBox {
    pub fn add_assign_inuse(&self, counters: &mut ResourceCounters) {
        counters.cores.inuse += self.cores;
        counters.memory.inuse += self.memory;
        counters.disk.inuse += self.disk;
        counters.gpus.inuse += self.gpus;
    }

    pub fn sub_assign_inuse(&self, counters: &mut ResourceCounters) {
        counters.cores.inuse = counters.cores.inuse.saturating_sub(self.cores);
        counters.memory.inuse = counters.memory.inuse.saturating_sub(self.memory);
        counters.disk.inuse = counters.disk.inuse.saturating_sub(self.disk);
        counters.gpus.inuse = counters.gpus.inuse.saturating_sub(self.gpus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_totals_and_bounds_extremes() {
        let mut agg = ResourceModel::new(4, 4, 4);
        let other = ResourceModel::new(8, 2, 8);
        agg.accumulate(&other);
        assert_eq!(agg.total, 12);
        assert_eq!(agg.smallest, 2);
        assert_eq!(agg.largest, 8);
    }

    #[test]
    fn overcommit_never_applies_to_disk() {
        let disk = ResourceModel::new(1000, 1000, 1000);
        assert_eq!(disk.admissible_total(ResourceKind::Disk, 2.0), 1000);
        let cores = ResourceModel::new(4, 4, 4);
        assert_eq!(cores.admissible_total(ResourceKind::Cores, 2.0), 8);
    }

    #[test]
    fn box_inuse_round_trips() {
        let mut counters = ResourceCounters::default();
        let b = ResourceBox {
            cores: 2,
            memory: 512,
            disk: 1024,
            gpus: 0,
            wall_time: 0,
            end_time: 0,
        };
        b.add_assign_inuse(&mut counters);
        assert_eq!(counters.cores.inuse, 2);
        b.sub_assign_inuse(&mut counters);
        assert_eq!(counters.cores.inuse, 0);
    }
}
