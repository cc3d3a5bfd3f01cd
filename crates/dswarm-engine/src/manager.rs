//! The single value threading all manager state (spec §9 design notes:
//! "the manager is a single value threaded through every operation; no
//! ambient singletons").

use std::collections::HashSet;

use crate::capacity::CapacityEstimator;
use crate::category::CategoryTable;
use crate::config::ManagerConfig;
use crate::resource::ResourceBox;
use crate::task::{Task, TaskDefinition, TaskId, TaskState, TaskTable};
use crate::worker::{RemoveReason, WorkerHandle, WorkerRegistry};

/// A side effect the lifecycle engine wants performed on a worker
/// connection. Kept separate from `Manager` itself so every state
/// transition stays synchronous and unit-testable; the wait loop (which
/// owns the actual sockets) drains and executes these after each turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send { handle: WorkerHandle, line: String },
    Disconnect { handle: WorkerHandle },
}

/// Aggregate counters surfaced in catalog updates and the HTTP status
/// responder (spec §6, §8 S5).
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub workers_joined: u64,
    pub workers_removed: u64,
}

pub struct Manager {
    pub config: ManagerConfig,
    pub tasks: TaskTable,
    pub workers: WorkerRegistry,
    pub categories: CategoryTable,
    pub capacity: CapacityEstimator,
    pub stats: GlobalStats,
    /// Workers that sent `available_results` and are due a `send_results`
    /// round (spec §4.8 step 5).
    pub pending_available_results: HashSet<WorkerHandle>,
    pub current_max_worker: ResourceBox,
    /// `(factory_name, max_workers)` updates pushed in from outside (spec
    /// §4.2 "Factory trim": an external catalog update lowering a
    /// factory's worker cap), drained once per `turn()`.
    pending_factory_updates: Vec<(String, u32)>,
    actions: Vec<OutboundAction>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            tasks: TaskTable::new(),
            workers: WorkerRegistry::new(),
            categories: CategoryTable::new(),
            capacity: CapacityEstimator::new(),
            stats: GlobalStats::default(),
            pending_available_results: HashSet::new(),
            current_max_worker: ResourceBox::default(),
            pending_factory_updates: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub(crate) fn push_action(&mut self, action: OutboundAction) {
        self.actions.push(action);
    }

    /// Applies an external catalog update of a factory's worker cap
    /// (spec §4.2 "Factory trim", §8 S6). Queued for `ManagerRuntime::turn`
    /// to apply and sweep on its next iteration, the same way task
    /// submission is a library call the embedding application makes
    /// directly rather than a worker-wire message.
    pub fn update_factory_capacity(&mut self, factory_name: impl Into<String>, max_workers: u32) {
        self.pending_factory_updates.push((factory_name.into(), max_workers));
    }

    pub(crate) fn drain_factory_updates(&mut self) -> Vec<(String, u32)> {
        std::mem::take(&mut self.pending_factory_updates)
    }

    /// Drains the actions accumulated since the last call, for the wait
    /// loop to execute against real sockets.
    pub fn drain_actions(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.actions)
    }

    /// Submits a brand-new task, returning its taskid (spec §3, §4.3).
    pub fn submit(&mut self, def: TaskDefinition, now_us: i64) -> TaskId {
        self.categories.get_or_create(&def.category);
        self.tasks.submit(def, now_us)
    }

    /// Re-submits a task after it reached DONE/CANCELED (spec §8 property 5).
    pub fn resubmit(&mut self, def: TaskDefinition) -> TaskId {
        self.categories.get_or_create(&def.category);
        self.tasks.resubmit(def, None)
    }

    /// `cancel_by_taskid`: immediate for running tasks (send `kill`,
    /// reap to CANCELED); direct state transition otherwise (spec §5).
    pub fn cancel_by_taskid(&mut self, taskid: TaskId) -> bool {
        let Some(task) = self.tasks.get(taskid) else {
            return false;
        };
        if task.state.is_terminal() {
            return false;
        }

        if let Some(handle) = task.worker {
            self.push_action(OutboundAction::Send {
                handle,
                line: crate::protocol::build_kill(taskid),
            });
            self.reap_task_from_worker(handle, taskid, TaskState::Canceled);
        } else {
            self.tasks.remove_from_ready(taskid);
            if let Some(t) = self.tasks.get_mut(taskid) {
                t.state = TaskState::Canceled;
            }
        }
        true
    }

    /// Reaps a task from its worker's bookkeeping, deletes its resource
    /// box, and advances its state (spec §4.7 "reap").
    pub fn reap_task_from_worker(&mut self, handle: WorkerHandle, taskid: TaskId, new_state: TaskState) {
        if let Some(w) = self.workers.lookup_mut(handle) {
            w.current_tasks.remove(&taskid);
            if let Some(b) = w.current_tasks_boxes.remove(&taskid) {
                b.sub_assign_inuse(&mut w.resources);
            }
        }
        if let Some(t) = self.tasks.get_mut(taskid) {
            t.worker = None;
            t.state = new_state;
        }
        match new_state {
            TaskState::Ready => self.tasks.push_ready(taskid),
            _ => {}
        }
    }

    pub fn is_idle_worker(&self, handle: WorkerHandle) -> bool {
        self.workers.lookup(handle).map(|w| w.is_idle()).unwrap_or(true)
    }

    /// Removes a worker and reaps every task it owned back to READY with
    /// `try_count` preserved (spec §4.2, §7 transport/worker failures).
    pub fn remove_worker(&mut self, handle: WorkerHandle, reason: RemoveReason) {
        let Some(removed) = self.workers.remove(handle, reason) else {
            return;
        };
        self.stats.workers_removed += 1;
        for taskid in removed.worker.current_tasks.iter().copied() {
            if let Some(t) = self.tasks.get_mut(taskid) {
                t.worker = None;
                t.state = TaskState::Ready;
            }
            self.tasks.push_ready(taskid);
        }
        self.recompute_current_max_worker();
    }

    pub fn recompute_current_max_worker(&mut self) {
        self.current_max_worker = self.workers.current_max_worker();
    }

    pub fn get_task(&self, taskid: TaskId) -> Option<&Task> {
        self.tasks.get(taskid)
    }

    /// Pops one RETRIEVED task (optionally matching `tag`) and transitions
    /// it to DONE, removing it from the table for the caller to own
    /// (spec §4.8 step 1, §3 "once DONE or CANCELED it is removed").
    pub fn take_done(&mut self, tag: Option<&str>) -> Option<Task> {
        let candidate = self
            .tasks
            .iter()
            .find(|t| {
                t.state == TaskState::Retrieved
                    && match tag {
                        None => true,
                        Some(tag) => t.def.tag.as_deref() == Some(tag),
                    }
            })
            .map(|t| t.taskid)?;
        let task = self.tasks.get_mut(candidate)?;
        task.state = TaskState::Done;
        task.timestamps.done_us = Some(chrono::Utc::now().timestamp_micros());
        self.tasks.take_terminal(candidate)
    }

    pub fn tasks_waiting(&self) -> usize {
        self.tasks.ready_len()
    }

    pub fn tasks_running(&self) -> usize {
        self.tasks.iter().filter(|t| t.state == TaskState::Running).count()
    }

    pub fn workers_connected(&self) -> usize {
        self.workers.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_unassigned_ready_task_transitions_directly() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let id = mgr.submit(TaskDefinition::default(), 0);
        assert!(mgr.cancel_by_taskid(id));
        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::Canceled);
        assert_eq!(mgr.tasks.ready_len(), 0);
    }

    #[test]
    fn cancel_running_task_sends_kill_and_reaps() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let id = mgr.submit(TaskDefinition::default(), 0);
        let h = mgr.workers.accept_new("a".to_string(), "a", 0).unwrap();
        mgr.tasks.get_mut(id).unwrap().worker = Some(h);
        mgr.tasks.get_mut(id).unwrap().state = TaskState::Running;
        mgr.workers.lookup_mut(h).unwrap().current_tasks.insert(id);

        assert!(mgr.cancel_by_taskid(id));
        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::Canceled);
        assert!(!mgr.workers.lookup(h).unwrap().current_tasks.contains(&id));
        let actions = mgr.drain_actions();
        assert!(actions
            .iter()
            .any(|a| matches!(a, OutboundAction::Send { line, .. } if line.starts_with("kill"))));
    }

    #[test]
    fn factory_capacity_update_is_queued_and_drained_once() {
        let mut mgr = Manager::new(ManagerConfig::default());
        mgr.update_factory_capacity("f", 1);
        mgr.update_factory_capacity("g", 2);
        let drained = mgr.drain_factory_updates();
        assert_eq!(drained, vec![("f".to_string(), 1), ("g".to_string(), 2)]);
        assert!(mgr.drain_factory_updates().is_empty());
    }

    #[test]
    fn worker_removal_reaps_owned_tasks_to_ready() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let id = mgr.submit(TaskDefinition::default(), 0);
        let h = mgr.workers.accept_new("a".to_string(), "a", 0).unwrap();
        mgr.tasks.remove_from_ready(id);
        mgr.tasks.get_mut(id).unwrap().worker = Some(h);
        mgr.tasks.get_mut(id).unwrap().state = TaskState::Running;
        mgr.tasks.get_mut(id).unwrap().try_count = 1;
        mgr.workers.lookup_mut(h).unwrap().current_tasks.insert(id);

        mgr.remove_worker(h, RemoveReason::Disconnect);
        let task = mgr.tasks.get(id).unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.try_count, 1);
        assert!(mgr.tasks.ready_ids().contains(&id));
    }
}
