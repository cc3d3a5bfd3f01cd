//! Task state transitions, commit/reap, keepalives, fast-abort, expiry,
//! and resource-exhaustion retry (spec §4.7).

use crate::category::NextLabel;
use crate::manager::{Manager, OutboundAction};
use crate::protocol::{self, InboundMessage};
use crate::resource::ResourceBox;
use crate::scheduler::{self, SchedulerPolicy};
use crate::task::{Outcome, Task, TaskId, TaskState};
use crate::worker::{RemoveReason, WorkerHandle};

fn floor_us(v: i64) -> i64 {
    v.max(1)
}

impl Manager {
    /// `commit_task_to_worker`: ships the task block and moves the task to
    /// RUNNING (spec §4.7).
    pub fn commit_task_to_worker(&mut self, handle: WorkerHandle, taskid: TaskId, now_us: i64) -> bool {
        let Some(category) = self
            .tasks
            .get(taskid)
            .map(|t| t.def.category.clone())
            .and_then(|name| self.categories.get(&name).cloned())
        else {
            return false;
        };
        let Some(worker) = self.workers.lookup(handle) else {
            return false;
        };

        let task = match self.tasks.get(taskid) {
            Some(t) => t.clone(),
            None => return false,
        };

        let mut box_ = scheduler::choose_resources(worker, &task, &category, self.config.force_proportional_resources);
        box_ = scheduler::apply_resource_request_mode(box_, worker, &task);

        let line = protocol::build_task_block(&task, &box_);

        self.tasks.remove_from_ready(taskid);
        if let Some(t) = self.tasks.get_mut(taskid) {
            t.timestamps.commit_start_us = Some(now_us);
            t.worker = Some(handle);
            t.state = TaskState::Running;
            t.try_count += 1;
            t.allocated_box = Some(box_);
            t.timestamps.commit_end_us = Some(now_us);
        }

        if let Some(w) = self.workers.lookup_mut(handle) {
            w.current_tasks.insert(taskid);
            w.current_tasks_boxes.insert(taskid, box_);
            w.recount_resources();
        }
        if let Some(cat) = self.categories.get_mut(&task.def.category) {
            cat.note_resources_seen(box_);
        }

        self.push_action(OutboundAction::Send { handle, line });
        true
    }

    /// Drives one ready task onto a worker, if the pool has at least
    /// `wait_for_workers` connections (spec §4.8 step 9).
    pub fn dispatch_one_ready_task(&mut self, now_us: i64, required_features: &std::collections::HashSet<String>) -> bool {
        if self.workers_connected() < self.config.wait_for_workers as usize {
            return false;
        }
        let Some(taskid) = self.tasks.ready_iter().next() else {
            return false;
        };
        let task = match self.tasks.get(taskid) {
            Some(t) => t.clone(),
            None => return false,
        };
        let Some(handle) = scheduler::choose_worker(&self.workers, &task, self.config.scheduler_policy, required_features)
        else {
            return false;
        };
        self.commit_task_to_worker(handle, taskid, now_us)
    }

    /// Handles a `result` line (spec §4.7 "Handling result"). `stdout` is
    /// the raw byte payload the reader spliced off the wire immediately
    /// following this line, sized by the line's own `out_len` field.
    pub fn handle_result_line(&mut self, handle: WorkerHandle, msg: InboundMessage, stdout: &[u8], now_us: i64) {
        let InboundMessage::Result {
            status,
            exit_code,
            out_len: _,
            exec_us,
            taskid,
        } = msg
        else {
            return;
        };

        let owned = self
            .workers
            .lookup(handle)
            .map(|w| w.current_tasks.contains(&taskid))
            .unwrap_or(false);
        if !owned {
            // Not assigned to the sender anymore: drop silently (spec §5).
            return;
        }

        if status.eq_ignore_ascii_case("FORSAKEN") {
            self.reap_task_from_worker(handle, taskid, TaskState::Ready);
            return;
        }

        let result = match status.as_str() {
            "0" => Outcome::Success,
            "OVERFLOW" => Outcome::ResourceExhaustion,
            "TIME_EXPIRE" => Outcome::TaskTimeout,
            "SIGNAL" => Outcome::Signal,
            "RMONITOR_ERROR" => Outcome::RmonitorError,
            _ if exit_code != 0 => Outcome::Signal,
            _ => Outcome::Success,
        };

        let commit_end = self.tasks.get(taskid).and_then(|t| t.timestamps.commit_end_us).unwrap_or(now_us);
        let elapsed_since_commit_end = (now_us - commit_end).max(0) as u64;
        let observed_exec_us = elapsed_since_commit_end.min(exec_us);

        if let Some(t) = self.tasks.get_mut(taskid) {
            t.result = result;
            t.exit_code = exit_code;
            t.measured_resources = Some(ResourceBox {
                wall_time: observed_exec_us / 1_000_000,
                ..t.allocated_box.unwrap_or_default()
            });
            t.append_stdout(stdout);
            t.state = TaskState::WaitingRetrieval;
            t.timestamps.retrieval_start_us = Some(now_us);
        }
        self.reap_task_from_worker(handle, taskid, TaskState::WaitingRetrieval);
        if matches!(result, Outcome::Success) {
            if let Some(w) = self.workers.lookup_mut(handle) {
                w.fast_abort_alarm = false;
            }
        }
    }

    /// `fetch_output_from_worker`: once the (external) output transfer has
    /// happened, settle the task's terminal bookkeeping (spec §4.7). The
    /// actual byte transfer is an out-of-scope black box (spec §1); the
    /// caller reports whether it succeeded.
    pub fn finish_retrieval(&mut self, taskid: TaskId, fetch_ok: bool, now_us: i64) {
        let Some(task) = self.tasks.get(taskid).cloned() else {
            return;
        };

        if !fetch_ok {
            if let Some(t) = self.tasks.get_mut(taskid) {
                t.result = Outcome::OutputMissing;
                t.state = TaskState::Retrieved;
            }
            return;
        }

        if task.result == Outcome::ResourceExhaustion {
            let category_name = task.def.category.clone();
            let last_box = task.allocated_box.unwrap_or_default();
            let next = self
                .categories
                .get(&category_name)
                .map(|c| c.next_label(last_box))
                .unwrap_or(NextLabel::GiveUp);

            match next {
                NextLabel::Retry(bigger) => {
                    let mut def = task.def.clone();
                    def.resources_requested.cores = Some(bigger.cores);
                    def.resources_requested.memory = Some(bigger.memory);
                    def.resources_requested.disk = Some(bigger.disk);
                    def.resources_requested.gpus = Some(bigger.gpus);
                    def.resource_request = crate::task::ResourceRequestMode::Max;
                    // take_terminal only removes from the table once the
                    // state is terminal; this attempt is being superseded
                    // by a fresh, larger-boxed resubmission.
                    if let Some(t) = self.tasks.get_mut(taskid) {
                        t.state = TaskState::Canceled;
                    }
                    self.tasks.take_terminal(taskid);
                    let new_id = self.tasks.submit(def, now_us);
                    self.tasks.remove_from_ready(new_id);
                    self.tasks.push_ready_head(new_id);
                    return;
                }
                NextLabel::GiveUp => {
                    if let Some(t) = self.tasks.get_mut(taskid) {
                        t.state = TaskState::Retrieved;
                    }
                    return;
                }
            }
        }

        if task.result == Outcome::Success {
            self.accumulate_task_stats(&task, now_us);
        }

        if let Some(t) = self.tasks.get_mut(taskid) {
            t.state = TaskState::Retrieved;
        }
    }

    /// `ds_accumulate_task`: folds one successfully completed task's timing
    /// into its category's running stats (spec §4.7 fast-abort) and appends
    /// a `TaskReport` to the capacity estimator (spec §4.5, §4.7 "Accumulate
    /// per-category stats and append a TaskReport"). The "send" phase is
    /// `commit_end - commit_start` rather than the original's
    /// `commit_end - commit_end` (spec "Open questions" — the latter is a
    /// probable bug in the source and is always zero).
    fn accumulate_task_stats(&mut self, task: &Task, now_us: i64) {
        let commit_start = task.timestamps.commit_start_us.unwrap_or(now_us);
        let commit_end = task.timestamps.commit_end_us.unwrap_or(commit_start);
        let retrieval_start = task.timestamps.retrieval_start_us.unwrap_or(now_us);

        let exec_s = task.measured_resources.map(|r| r.wall_time as f64).unwrap_or(0.0);
        let send_us = (commit_end - commit_start).max(0) as u64;
        let recv_us = (now_us - retrieval_start).max(0) as u64;

        if let Some(cat) = self.categories.get_mut(&task.def.category) {
            cat.stats.record_good(exec_s, send_us as f64 / 1_000_000.0, recv_us as f64 / 1_000_000.0);
        }

        let tasks_on_workers = self.workers.iter().map(|w| w.current_tasks.len()).sum();
        self.capacity.record(
            crate::capacity::TaskReport {
                transfer_time_us: recv_us,
                exec_time_us: (exec_s * 1_000_000.0) as u64,
                manager_time_us: send_us,
                allocated: task.allocated_box.unwrap_or_default(),
            },
            tasks_on_workers,
        );
    }

    /// `ask_for_workers_updates`: per-worker keepalive probing
    /// (spec §4.7).
    pub fn send_keepalives(&mut self, now_us: i64) {
        let interval_us = self.config.keepalive_interval_s * 1_000_000;
        let timeout_us = self.config.keepalive_timeout_s * 1_000_000;
        if interval_us <= 0 {
            return;
        }

        let mut to_remove = Vec::new();
        for w in self.workers.iter_mut() {
            if w.hostname == "unknown" && now_us - w.start_time_us >= timeout_us {
                to_remove.push(w.handle);
                continue;
            }
            let received_since_check = w.last_msg_recv_time_us >= w.last_update_msg_time_us;
            if received_since_check && now_us - w.last_update_msg_time_us >= interval_us {
                w.last_update_msg_time_us = now_us;
                self.actions_buf_send(w.handle, protocol::build_check().to_string());
            } else if !received_since_check && now_us - w.last_update_msg_time_us >= timeout_us {
                to_remove.push(w.handle);
            }
        }
        for handle in to_remove {
            self.remove_worker(handle, RemoveReason::KeepaliveTimeout);
        }
    }

    fn actions_buf_send(&mut self, handle: WorkerHandle, line: String) {
        self.push_action(OutboundAction::Send { handle, line });
    }

    /// Fast-abort pass: cancels running tasks that have overrun their
    /// category's average completion time, blocklisting a worker on its
    /// second consecutive strike (spec §4.7, §8 S4).
    pub fn run_fast_abort(&mut self, now_us: i64) {
        let running: Vec<(TaskId, WorkerHandle, String, i64)> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .filter_map(|t| {
                t.worker
                    .map(|h| (t.taskid, h, t.def.category.clone(), t.timestamps.commit_end_us.unwrap_or(now_us)))
            })
            .collect();

        let mut second_strike = Vec::new();
        for (taskid, handle, category_name, commit_end) in running {
            let Some(cat) = self.categories.get(&category_name) else {
                continue;
            };
            let Some(avg) = cat.stats.average_task_time() else {
                continue;
            };
            let multiplier = if cat.fast_abort_multiplier > 0.0 {
                cat.fast_abort_multiplier
            } else if cat.fast_abort_multiplier == 0.0 {
                continue;
            } else {
                self.config.default_fast_abort_multiplier
            };

            let runtime_s = floor_us(now_us - commit_end) as f64 / 1_000_000.0;
            let fast_abort_count = self.tasks.get(taskid).map(|t| t.fast_abort_count).unwrap_or(0) as f64;
            if runtime_s >= avg * (multiplier + fast_abort_count) {
                self.reap_task_from_worker(handle, taskid, TaskState::Ready);
                if let Some(t) = self.tasks.get_mut(taskid) {
                    t.fast_abort_count += 1;
                }
                let already_armed = self.workers.lookup(handle).map(|w| w.fast_abort_alarm).unwrap_or(false);
                if already_armed {
                    second_strike.push(handle);
                } else if let Some(w) = self.workers.lookup_mut(handle) {
                    w.fast_abort_alarm = true;
                }
            }
        }

        for handle in second_strike {
            if let Some(w) = self.workers.lookup(handle) {
                let hostname = w.hostname.clone();
                self.workers.block(hostname, self.config.keepalive_timeout_s, now_us);
            }
            self.remove_worker(handle, RemoveReason::FastAbort);
        }
    }

    /// Walks the ready list for deadline/try-limit expiry (spec §4.7).
    pub fn expire_ready_tasks(&mut self, now_s: i64) {
        let ready: Vec<TaskId> = self.tasks.ready_iter().collect();
        for taskid in ready {
            let Some(task) = self.tasks.get(taskid) else { continue };
            let req = task.def.resources_requested;
            let max_retries = task.def.max_retries;
            let try_count = task.try_count;

            if req.end.is_some_and(|end| end > 0 && end <= now_s) {
                self.tasks.remove_from_ready(taskid);
                if let Some(t) = self.tasks.get_mut(taskid) {
                    t.result = Outcome::TaskTimeout;
                    t.state = TaskState::Retrieved;
                }
            } else if max_retries > 0 && try_count > max_retries {
                self.tasks.remove_from_ready(taskid);
                if let Some(t) = self.tasks.get_mut(taskid) {
                    t.result = Outcome::MaxRetries;
                    t.state = TaskState::Retrieved;
                }
            }
        }
    }

    /// Shuts down any worker marked `draining` once it has no running
    /// tasks left (spec §4.7 "Drain").
    pub fn drain_idle_workers(&mut self) {
        let idle_draining: Vec<WorkerHandle> = self
            .workers
            .iter()
            .filter(|w| w.draining && w.is_idle())
            .map(|w| w.handle)
            .collect();
        for handle in idle_draining {
            self.push_action(OutboundAction::Send {
                handle,
                line: protocol::build_exit().to_string(),
            });
            self.push_action(OutboundAction::Disconnect { handle });
            self.remove_worker(handle, RemoveReason::Drain);
        }
    }

    /// Picks one WAITING_RETRIEVAL task and transitions it to RETRIEVED by
    /// invoking the (externally supplied) output-fetch outcome.
    pub fn receive_one_pending_task(&mut self, now_us: i64, fetch: impl FnOnce(&Task) -> bool) -> bool {
        let Some(taskid) = self
            .tasks
            .iter()
            .find(|t| t.state == TaskState::WaitingRetrieval)
            .map(|t| t.taskid)
        else {
            return false;
        };
        let ok = self.tasks.get(taskid).map(fetch).unwrap_or(false);
        self.finish_retrieval(taskid, ok, now_us);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::resource::ResourceModel;
    use crate::task::TaskDefinition;

    fn setup_worker(mgr: &mut Manager) -> WorkerHandle {
        let h = mgr.workers.accept_new("w".to_string(), "w", 0).unwrap();
        let w = mgr.workers.lookup_mut(h).unwrap();
        w.resources.workers = ResourceModel::new(1, 1, 1);
        w.resources.cores = ResourceModel::new(4, 4, 4);
        w.resources.memory = ResourceModel::new(4096, 4096, 4096);
        w.resources.disk = ResourceModel::new(40960, 40960, 40960);
        h
    }

    #[test]
    fn commit_moves_task_to_running_and_updates_inuse() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let h = setup_worker(&mut mgr);
        let id = mgr.submit(
            TaskDefinition {
                command_line: "/bin/true".to_string(),
                ..Default::default()
            },
            0,
        );
        assert!(mgr.commit_task_to_worker(h, id, 0));
        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::Running);
        assert_eq!(mgr.tasks.get(id).unwrap().try_count, 1);
        assert!(mgr.workers.lookup(h).unwrap().resources.cores.inuse > 0);
        let actions = mgr.drain_actions();
        assert!(actions.iter().any(|a| matches!(a, OutboundAction::Send { line, .. } if line.starts_with("task "))));
    }

    #[test]
    fn successful_result_moves_to_waiting_retrieval_and_frees_worker() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let h = setup_worker(&mut mgr);
        let id = mgr.submit(TaskDefinition::default(), 0);
        mgr.commit_task_to_worker(h, id, 0);
        mgr.drain_actions();

        mgr.handle_result_line(
            h,
            InboundMessage::Result {
                status: "0".to_string(),
                exit_code: 0,
                out_len: 0,
                exec_us: 100,
                taskid: id,
            },
            &[],
            1_000_000,
        );

        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::WaitingRetrieval);
        assert_eq!(mgr.tasks.get(id).unwrap().result, Outcome::Success);
        assert!(mgr.workers.lookup(h).unwrap().current_tasks.is_empty());
    }

    #[test]
    fn result_line_appends_the_delivered_stdout_bytes() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let h = setup_worker(&mut mgr);
        let id = mgr.submit(TaskDefinition::default(), 0);
        mgr.commit_task_to_worker(h, id, 0);
        mgr.drain_actions();

        mgr.handle_result_line(
            h,
            InboundMessage::Result {
                status: "0".to_string(),
                exit_code: 0,
                out_len: 5,
                exec_us: 100,
                taskid: id,
            },
            b"hello",
            1_000_000,
        );

        assert_eq!(mgr.tasks.get(id).unwrap().stdout, b"hello");
    }

    #[test]
    fn result_for_unowned_task_is_dropped() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let h = setup_worker(&mut mgr);
        let id = mgr.submit(TaskDefinition::default(), 0);
        // Task never committed to `h`, so the result should be ignored.
        mgr.handle_result_line(
            h,
            InboundMessage::Result {
                status: "0".to_string(),
                exit_code: 0,
                out_len: 0,
                exec_us: 1,
                taskid: id,
            },
            &[],
            0,
        );
        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn expiry_marks_timeout_and_max_retries() {
        let mut mgr = Manager::new(ManagerConfig::default());
        let mut def = TaskDefinition::default();
        def.resources_requested.end = Some(10);
        let id = mgr.submit(def, 0);
        mgr.expire_ready_tasks(11);
        assert_eq!(mgr.tasks.get(id).unwrap().result, Outcome::TaskTimeout);
        assert_eq!(mgr.tasks.get(id).unwrap().state, TaskState::Retrieved);
    }
}
