//! Worker bookkeeping: connection records, the blocklist, and factory
//! trimming (spec §3 Worker, §4.2 WorkerRegistry).

use std::collections::{HashMap, HashSet};

use crate::resource::{ResourceBox, ResourceCounters};
use crate::task::TaskId;

pub type WorkerHandle = u64;

/// `type` ∈ {UNKNOWN, WORKER, STATUS} (spec §3). Kept as a tagged variant
/// rather than a trait hierarchy per the design notes in spec §9: each
/// kind participates in a disjoint subset of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerKind {
    #[default]
    Unknown,
    Worker,
    Status,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CachedFile {
    pub size: u64,
    pub transfer_time_us: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub joined: u64,
    pub removed: u64,
    pub time_send_us: u64,
    pub time_receive_us: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerTotals {
    pub total_transfer_time_us: u64,
    pub total_bytes_transferred: u64,
    pub total_tasks_complete: u64,
    pub total_task_time_us: u64,
}

/// A connected (or connecting) worker process (spec §3).
#[derive(Debug, Clone)]
pub struct Worker {
    pub handle: WorkerHandle,
    pub hostname: String,
    pub addrport: String,
    pub workerid: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub factory_name: Option<String>,
    pub kind: WorkerKind,

    pub resources: ResourceCounters,
    pub current_files: HashMap<String, CachedFile>,
    pub current_tasks: HashSet<TaskId>,
    pub current_tasks_boxes: HashMap<TaskId, ResourceBox>,

    pub transfer_addr: Option<String>,
    pub transfer_port: Option<u16>,
    pub transfer_active: bool,

    pub start_time_us: i64,
    pub last_msg_recv_time_us: i64,
    pub last_update_msg_time_us: i64,
    pub draining: bool,
    pub fast_abort_alarm: bool,
    pub end_time_us: Option<i64>,
    pub features: HashSet<String>,
    pub stats: WorkerStats,
    pub totals: WorkerTotals,
}

impl Worker {
    fn new(handle: WorkerHandle, addrport: String, now_us: i64) -> Self {
        Self {
            handle,
            hostname: "unknown".to_string(),
            addrport,
            workerid: "unknown".to_string(),
            os: String::new(),
            arch: String::new(),
            version: String::new(),
            factory_name: None,
            kind: WorkerKind::Unknown,
            resources: ResourceCounters::default(),
            current_files: HashMap::new(),
            current_tasks: HashSet::new(),
            current_tasks_boxes: HashMap::new(),
            transfer_addr: None,
            transfer_port: None,
            transfer_active: false,
            start_time_us: now_us,
            last_msg_recv_time_us: now_us,
            last_update_msg_time_us: now_us,
            draining: false,
            fast_abort_alarm: false,
            end_time_us: None,
            features: HashSet::new(),
            stats: WorkerStats::default(),
            totals: WorkerTotals::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_tasks.is_empty()
    }

    /// Recomputes `resources.*.inuse` from the current set of allocated
    /// boxes (invariant 1, spec §8; called at commit/reap/`end_of_resource_update`).
    pub fn recount_resources(&mut self) {
        self.resources.cores.inuse = 0;
        self.resources.memory.inuse = 0;
        self.resources.disk.inuse = 0;
        self.resources.gpus.inuse = 0;
        for b in self.current_tasks_boxes.values() {
            b.add_assign_inuse(&mut self.resources);
        }
    }
}

/// Per-factory state (spec §3 FactoryInfo).
#[derive(Debug, Clone, Default)]
pub struct FactoryInfo {
    pub factory_name: String,
    pub max_workers: u32,
    pub connected_workers: u32,
    pub seen_at_catalog: bool,
}

/// Reason a worker was removed, used for stats/log purposes and by
/// fast-abort's second-strike blocklisting (spec §4.7, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    Disconnect,
    KeepaliveTimeout,
    FastAbort,
    ProtocolMismatch,
    AuthenticationFailure,
    FactoryTrim,
    Drain,
    Release,
}

pub struct RemovedWorker {
    pub worker: Worker,
    pub reason: RemoveReason,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerHandle, Worker>,
    next_handle: WorkerHandle,
    /// hostname -> ban expiry (unix micros); `None` means banned forever.
    blocklist: HashMap<String, Option<i64>>,
    factories: HashMap<String, FactoryInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            next_handle: 1,
            blocklist: HashMap::new(),
            factories: HashMap::new(),
        }
    }

    /// Accepts a newly connected socket, keyed by a fresh connection
    /// handle, with `hostname="unknown"`, `type=UNKNOWN` (spec §4.2).
    /// Rejects (returns `None`) when the remote host is currently
    /// blocklisted (invariant 5).
    pub fn accept_new(&mut self, addrport: String, remote_host: &str, now_us: i64) -> Option<WorkerHandle> {
        if self.is_blocked(remote_host, now_us) {
            return None;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.workers.insert(handle, Worker::new(handle, addrport, now_us));
        Some(handle)
    }

    pub fn lookup(&self, handle: WorkerHandle) -> Option<&Worker> {
        self.workers.get(&handle)
    }

    pub fn lookup_mut(&mut self, handle: WorkerHandle) -> Option<&mut Worker> {
        self.workers.get_mut(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.values_mut()
    }

    pub fn handles(&self) -> impl Iterator<Item = WorkerHandle> + '_ {
        self.workers.keys().copied()
    }

    /// Removes a worker, returning it so the lifecycle engine can reap its
    /// owned tasks back to READY with `try_count` preserved (spec §4.2).
    pub fn remove(&mut self, handle: WorkerHandle, reason: RemoveReason) -> Option<RemovedWorker> {
        let worker = self.workers.remove(&handle)?;
        if let Some(name) = &worker.factory_name {
            if let Some(f) = self.factories.get_mut(name) {
                f.connected_workers = f.connected_workers.saturating_sub(1);
            }
        }
        Some(RemovedWorker { worker, reason })
    }

    pub fn block(&mut self, hostname: impl Into<String>, timeout_s: i64, now_us: i64) {
        let expiry = if timeout_s < 0 {
            None
        } else {
            Some(now_us + timeout_s * 1_000_000)
        };
        self.blocklist.insert(hostname.into(), expiry);
    }

    pub fn unblock(&mut self, hostname: &str) {
        self.blocklist.remove(hostname);
    }

    pub fn is_blocked(&self, hostname: &str, now_us: i64) -> bool {
        match self.blocklist.get(hostname) {
            None => false,
            Some(None) => true,
            Some(Some(expiry)) => now_us < *expiry,
        }
    }

    /// Drops any expired bans; run once per wait-loop turn (spec §4.2).
    pub fn unblock_expired(&mut self, now_us: i64) {
        self.blocklist.retain(|_, expiry| match expiry {
            None => true,
            Some(e) => now_us < *e,
        });
    }

    pub fn associate_with_factory(&mut self, handle: WorkerHandle, factory_name: impl Into<String>) {
        let name = factory_name.into();
        if let Some(w) = self.workers.get_mut(&handle) {
            w.factory_name = Some(name.clone());
        }
        let entry = self.factories.entry(name.clone()).or_insert_with(|| FactoryInfo {
            factory_name: name,
            max_workers: u32::MAX,
            connected_workers: 0,
            seen_at_catalog: false,
        });
        entry.connected_workers += 1;
    }

    pub fn factory(&self, name: &str) -> Option<&FactoryInfo> {
        self.factories.get(name)
    }

    pub fn set_factory_max_workers(&mut self, name: &str, max_workers: u32) {
        let entry = self.factories.entry(name.to_string()).or_insert_with(|| FactoryInfo {
            factory_name: name.to_string(),
            max_workers,
            connected_workers: 0,
            seen_at_catalog: true,
        });
        entry.max_workers = max_workers;
    }

    /// Picks idle workers belonging to an over-capacity factory to shut
    /// down, never touching a worker with running tasks (spec §4.2, §8 S6).
    pub fn factory_trim_candidates(&self, factory_name: &str) -> Vec<WorkerHandle> {
        let Some(info) = self.factories.get(factory_name) else {
            return Vec::new();
        };
        if info.connected_workers <= info.max_workers {
            return Vec::new();
        }
        let excess = (info.connected_workers - info.max_workers) as usize;
        self.workers
            .values()
            .filter(|w| w.factory_name.as_deref() == Some(factory_name) && w.is_idle())
            .take(excess)
            .map(|w| w.handle)
            .collect()
    }

    /// Invariant 7: componentwise max of `largest` across workers with at
    /// least one worker-slot total.
    pub fn current_max_worker(&self) -> ResourceBox {
        let mut max = ResourceBox::default();
        for w in self.workers.values() {
            if w.resources.workers.total < 1 {
                continue;
            }
            max.cores = max.cores.max(w.resources.cores.largest);
            max.memory = max.memory.max(w.resources.memory.largest);
            max.disk = max.disk.max(w.resources.disk.largest);
            max.gpus = max.gpus.max(w.resources.gpus.largest);
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_host_is_rejected() {
        let mut reg = WorkerRegistry::new();
        reg.block("evil.example", -1, 0);
        assert!(reg.accept_new("1.2.3.4:9".to_string(), "evil.example", 0).is_none());
    }

    #[test]
    fn temporary_block_expires() {
        let mut reg = WorkerRegistry::new();
        reg.block("flaky.example", 10, 0);
        assert!(reg.is_blocked("flaky.example", 0));
        reg.unblock_expired(11_000_000);
        assert!(!reg.is_blocked("flaky.example", 11_000_000));
    }

    #[test]
    fn factory_trim_only_picks_idle_workers() {
        let mut reg = WorkerRegistry::new();
        let h1 = reg.accept_new("a".to_string(), "a", 0).unwrap();
        let h2 = reg.accept_new("b".to_string(), "b", 0).unwrap();
        let h3 = reg.accept_new("c".to_string(), "c", 0).unwrap();
        reg.associate_with_factory(h1, "f");
        reg.associate_with_factory(h2, "f");
        reg.associate_with_factory(h3, "f");
        reg.lookup_mut(h2).unwrap().current_tasks.insert(1);
        reg.set_factory_max_workers("f", 1);

        let victims = reg.factory_trim_candidates("f");
        assert_eq!(victims.len(), 2);
        assert!(!victims.contains(&h2));
    }

    #[test]
    fn current_max_worker_ignores_zero_slot_workers() {
        let mut reg = WorkerRegistry::new();
        let h1 = reg.accept_new("a".to_string(), "a", 0).unwrap();
        reg.lookup_mut(h1).unwrap().resources.workers.total = 0;
        reg.lookup_mut(h1).unwrap().resources.cores.largest = 64;
        assert_eq!(reg.current_max_worker().cores, 0);

        reg.lookup_mut(h1).unwrap().resources.workers.total = 1;
        assert_eq!(reg.current_max_worker().cores, 64);
    }
}
