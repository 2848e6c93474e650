use crate::types::{ExecutionPlan, PlanStatus};
use chrono::{DateTime, Utc};
use conductor_core::Payload;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Outcome of one finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: Uuid,
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub failed_step: Option<u32>,
}

impl HistoryEntry {
    /// Record a terminal plan.
    pub fn from_plan(plan: &ExecutionPlan, elapsed_ms: u64) -> Self {
        Self {
            task_id: plan.task_id,
            plan_id: plan.id,
            status: plan.status,
            created_at: plan.created_at,
            completed_at: Utc::now(),
            elapsed_ms,
            result: plan.final_result().cloned(),
            error: plan.failure.as_ref().map(ToString::to_string),
            failed_step: plan.failure.as_ref().and_then(|f| f.step_number),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}

/// Bounded, append-only record of finished executions. The oldest entries
/// are evicted first.
pub struct ExecutionHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl ExecutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Completed share of recorded executions; `1.0` when nothing is recorded.
    pub fn success_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 1.0;
        }
        let ok = self.entries.iter().filter(|e| e.succeeded()).count();
        ok as f64 / self.entries.len() as f64
    }

    pub fn average_elapsed_ms(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let total: u64 = self.entries.iter().map(|e| e.elapsed_ms).sum();
        total / self.entries.len() as u64
    }

    /// Most recent entries first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(n).cloned().collect()
    }
}
