//! Task data model and the task table / ready queue (spec §3, §4.3).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::resource::ResourceBox;
use crate::worker::WorkerHandle;

pub type TaskId = u64;

/// Task lifecycle states (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Unknown,
    Ready,
    Running,
    WaitingRetrieval,
    Retrieved,
    Done,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Canceled)
    }
}

/// The outcome recorded on a task once it leaves `Running`. `Success` is
/// the only non-failure variant; everything else is one of the failure
/// kinds enumerated in spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Outcome {
    #[default]
    Unknown,
    Success,
    InputMissing,
    OutputMissing,
    StdoutMissing,
    TaskTimeout,
    TaskMaxRunTime,
    DiskAllocFull,
    OutputTransferError,
    Signal,
    RmonitorError,
    ResourceExhaustion,
    Forsaken,
    MaxRetries,
    CategoryAllocationError,
    /// The worker that owned this task vanished; it was reaped back to
    /// READY rather than failed, but this value can still show up
    /// transiently on a task mid-requeue for diagnostics.
    WorkerFailure,
}

/// `resource_request` ∈ {FIRST, MAX} (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceRequestMode {
    #[default]
    First,
    Max,
}

/// File type for a task's input/output file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

/// Flags bitmask on a task file: CACHE (reusable across tasks) and WATCH
/// (append-only output streamed back via `update` lines).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags(pub u8);

impl FileFlags {
    pub const CACHE: FileFlags = FileFlags(1 << 0);
    pub const WATCH: FileFlags = FileFlags(1 << 1);

    pub fn contains(self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FileFlags) -> FileFlags {
        FileFlags(self.0 | other.0)
    }
}

/// One entry in a task's input or output file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub local_path: String,
    pub remote_cached_name: String,
    pub remote_visible_name: String,
    pub kind: FileKind,
    pub flags: FileFlags,
}

/// The resources a task asks for; any dimension left `None` is filled in by
/// the scheduler (spec §4.4).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cores: Option<u64>,
    pub memory: Option<u64>,
    pub disk: Option<u64>,
    pub gpus: Option<u64>,
    /// Absolute deadline (unix seconds); 0/`None` means no deadline.
    pub end: Option<i64>,
    pub wall_time: Option<u64>,
    pub start: Option<i64>,
}

/// Timestamps recorded across a task's lifetime, in microseconds since the
/// epoch (spec §4.5 floors all time math at 1 microsecond to avoid
/// division by zero, so everything downstream of these is kept at the same
/// resolution).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub submitted_us: Option<i64>,
    pub commit_start_us: Option<i64>,
    pub commit_end_us: Option<i64>,
    pub retrieval_start_us: Option<i64>,
    pub done_us: Option<i64>,
}

/// The static definition of a task: what survives a resubmission
/// (spec §3 "preserving its definition", §8 property 5).
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub tag: Option<String>,
    pub category: String,
    pub command_line: String,
    pub coprocess_command: Option<String>,
    pub env: Vec<(String, String)>,
    pub input_files: Vec<TaskFile>,
    pub output_files: Vec<TaskFile>,
    pub resources_requested: ResourceSpec,
    pub resource_request: ResourceRequestMode,
    pub priority: i64,
    pub max_retries: u32,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            tag: None,
            category: "default".to_string(),
            command_line: String::new(),
            coprocess_command: None,
            env: Vec::new(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            resources_requested: ResourceSpec::default(),
            resource_request: ResourceRequestMode::default(),
            priority: 0,
            max_retries: 0,
        }
    }
}

/// Maximum bytes of stdout retained per task (spec §3, §8 property 7).
pub const MAX_TASK_STDOUT_STORAGE: usize = 1 << 30;

const STDOUT_TRUNCATED_MARKER: &str = "\n[... OUTPUT TRUNCATED. MAX OUTPUT 1073741824 BYTES TRUNCATED.]";

/// A task, static definition plus dynamic lifecycle state.
#[derive(Debug, Clone)]
pub struct Task {
    pub taskid: TaskId,
    pub def: TaskDefinition,

    pub state: TaskState,
    pub result: Outcome,
    pub exit_code: i32,
    pub try_count: u32,
    pub fast_abort_count: u32,
    pub exhausted_attempts: u32,
    pub worker: Option<WorkerHandle>,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub measured_resources: Option<ResourceBox>,
    pub allocated_box: Option<ResourceBox>,
    pub timestamps: TaskTimestamps,
}

impl Task {
    pub(crate) fn new(taskid: TaskId, def: TaskDefinition, submitted_us: i64) -> Self {
        Self {
            taskid,
            def,
            state: TaskState::Ready,
            result: Outcome::Unknown,
            exit_code: 0,
            try_count: 0,
            fast_abort_count: 0,
            exhausted_attempts: 0,
            worker: None,
            stdout: Vec::new(),
            stdout_truncated: false,
            measured_resources: None,
            allocated_box: None,
            timestamps: TaskTimestamps {
                submitted_us: Some(submitted_us),
                ..Default::default()
            },
        }
    }

    /// Appends to stdout, truncating at `MAX_TASK_STDOUT_STORAGE` and
    /// leaving a marker that ends in `BYTES TRUNCATED.` (spec §8 property 7).
    pub fn append_stdout(&mut self, chunk: &[u8]) {
        if self.stdout_truncated {
            return;
        }
        let budget = MAX_TASK_STDOUT_STORAGE.saturating_sub(self.stdout.len());
        if chunk.len() <= budget {
            self.stdout.extend_from_slice(chunk);
            return;
        }
        self.stdout.extend_from_slice(&chunk[..budget]);
        self.stdout.extend_from_slice(STDOUT_TRUNCATED_MARKER.as_bytes());
        self.stdout_truncated = true;
    }
}

/// Mapping from taskid to `Task`, plus the priority-ordered ready queue
/// (spec §4.3).
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    next_id: TaskId,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Submits a brand-new task definition, returning its fresh taskid.
    /// Always succeeds: a new submission has no prior state to violate
    /// (spec §8 property 5).
    pub fn submit(&mut self, def: TaskDefinition, now_us: i64) -> TaskId {
        let taskid = self.next_id;
        self.next_id += 1;
        let task = Task::new(taskid, def, now_us);
        self.insert_ready_sorted(taskid, task.def.priority);
        self.tasks.insert(taskid, task);
        taskid
    }

    /// Re-submits a task definition after it reached a terminal state,
    /// resetting per-attempt stats (spec §3, §8 property 5). The previous
    /// task is expected to already be gone from the table (terminal tasks
    /// are removed by `take_terminal`); passing a non-terminal task here is
    /// a caller bug.
    pub fn resubmit(&mut self, mut def: TaskDefinition, priority_override: Option<i64>) -> TaskId {
        if let Some(p) = priority_override {
            def.priority = p;
        }
        self.submit(def, chrono::Utc::now().timestamp_micros())
    }

    pub fn get(&self, taskid: TaskId) -> Option<&Task> {
        self.tasks.get(&taskid)
    }

    pub fn get_mut(&mut self, taskid: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&taskid)
    }

    pub fn contains(&self, taskid: TaskId) -> bool {
        self.tasks.contains_key(&taskid)
    }

    /// Every non-terminal task, by invariant 1 of spec §3.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    /// Removes a task once it has reached DONE or CANCELED; the caller now
    /// owns the returned value (spec §3, Open Questions: caller-owned).
    pub fn take_terminal(&mut self, taskid: TaskId) -> Option<Task> {
        match self.tasks.get(&taskid) {
            Some(t) if t.state.is_terminal() => self.tasks.remove(&taskid),
            _ => None,
        }
    }

    /// Priority-ordered insert (higher priority first); stable among equal
    /// priorities (spec §4.3).
    fn insert_ready_sorted(&mut self, taskid: TaskId, priority: i64) {
        let pos = self
            .ready
            .iter()
            .position(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.def.priority < priority)
                    .unwrap_or(false)
            })
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, taskid);
    }

    pub fn push_ready(&mut self, taskid: TaskId) {
        if let Some(task) = self.tasks.get_mut(&taskid) {
            task.state = TaskState::Ready;
        }
        let priority = self.tasks.get(&taskid).map(|t| t.def.priority).unwrap_or(0);
        self.insert_ready_sorted(taskid, priority);
    }

    /// Pushes a resubmitted-on-resource-exhaustion task to the head of the
    /// queue regardless of priority, so up-sized retries run ahead of
    /// smaller tasks (spec §4.3).
    pub fn push_ready_head(&mut self, taskid: TaskId) {
        if let Some(task) = self.tasks.get_mut(&taskid) {
            task.state = TaskState::Ready;
        }
        self.ready.push_front(taskid);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn ready_iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter().copied()
    }

    /// Removes a single taskid from the ready queue (called once the
    /// scheduler commits it to a worker).
    pub fn remove_from_ready(&mut self, taskid: TaskId) {
        if let Some(pos) = self.ready.iter().position(|id| *id == taskid) {
            self.ready.remove(pos);
        }
    }

    #[cfg(test)]
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.ready.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(priority: i64) -> TaskDefinition {
        TaskDefinition {
            priority,
            command_line: "/bin/true".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn higher_priority_goes_first() {
        let mut table = TaskTable::new();
        let low = table.submit(def(1), 0);
        let high = table.submit(def(10), 0);
        assert_eq!(table.ready_ids(), vec![high, low]);
    }

    #[test]
    fn exhaustion_resubmit_goes_to_head_regardless_of_priority() {
        let mut table = TaskTable::new();
        let high = table.submit(def(100), 0);
        let low = table.submit(def(1), 0);
        table.remove_from_ready(low);
        table.push_ready_head(low);
        assert_eq!(table.ready_ids()[0], low);
        assert!(table.ready_ids().contains(&high));
    }

    #[test]
    fn stdout_truncates_with_marker() {
        let mut task = Task::new(1, TaskDefinition::default(), 0);
        let small = vec![b'x'; 16];
        task.append_stdout(&small);
        assert_eq!(task.stdout.len(), 16);
        assert!(!task.stdout_truncated);
    }

    #[test]
    fn terminal_task_is_removed_on_take() {
        let mut table = TaskTable::new();
        let id = table.submit(def(0), 0);
        assert!(table.take_terminal(id).is_none());
        table.get_mut(id).unwrap().state = TaskState::Done;
        let taken = table.take_terminal(id);
        assert!(taken.is_some());
        assert!(table.get(id).is_none());
    }
}
