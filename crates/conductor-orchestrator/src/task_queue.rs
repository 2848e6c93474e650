use crate::types::{ExecutionPlan, Task};
use std::collections::HashSet;
use uuid::Uuid;

/// A task waiting for an execution slot, together with its compiled plan.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub plan: ExecutionPlan,
    seq: u64,
}

/// Pending tasks in dispatch order: highest priority first, then submission order.
pub struct PendingQueue {
    entries: Vec<QueuedTask>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Enqueue a task and its plan. Returns the task id.
    pub fn push(&mut self, task: Task, plan: ExecutionPlan) -> Uuid {
        let id = task.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueuedTask { task, plan, seq };
        let at = self
            .entries
            .iter()
            .position(|e| Self::before(&entry, e))
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
        id
    }

    fn before(a: &QueuedTask, b: &QueuedTask) -> bool {
        a.task.priority > b.task.priority || (a.task.priority == b.task.priority && a.seq < b.seq)
    }

    /// First task, in dispatch order, whose task-level dependencies are all
    /// in `completed`.
    pub fn next_ready(&self, completed: &[Uuid]) -> Option<&QueuedTask> {
        self.entries.iter().find(|e| e.task.is_ready(completed))
    }

    /// Every task id some queued task still waits on.
    pub fn dependencies(&self) -> HashSet<Uuid> {
        self.entries
            .iter()
            .flat_map(|e| e.task.dependencies.iter().copied())
            .collect()
    }

    /// Tasks that can never run because a dependency is in `failed`.
    pub fn blocked_by(&self, failed: &[Uuid]) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|e| e.task.dependencies.iter().any(|d| failed.contains(d)))
            .map(|e| e.task.id)
            .collect()
    }

    pub fn remove(&mut self, task_id: Uuid) -> Option<QueuedTask> {
        let at = self.entries.iter().position(|e| e.task.id == task_id)?;
        Some(self.entries.remove(at))
    }

    /// Remove the entry whose plan is `plan_id`.
    pub fn remove_plan(&mut self, plan_id: Uuid) -> Option<QueuedTask> {
        let at = self.entries.iter().position(|e| e.plan.id == plan_id)?;
        Some(self.entries.remove(at))
    }

    pub fn contains_plan(&self, plan_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.plan.id == plan_id)
    }

    /// Task ids in dispatch order.
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.task.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}
