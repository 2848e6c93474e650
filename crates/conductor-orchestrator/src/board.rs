use crate::types::{ExecutionPlan, PlanFailure, PlanStatus};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Latest snapshot of every tracked plan.
///
/// Snapshots are replaced whole at step and plan transitions, so readers never
/// see a half-applied update. Once a plan is terminal its snapshot is frozen.
pub struct PlanBoard {
    plans: RwLock<HashMap<Uuid, ExecutionPlan>>,
    version: watch::Sender<u64>,
}

impl PlanBoard {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            plans: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// Store `plan` as the current snapshot.
    ///
    /// Returns `false` (and stores nothing) if the stored snapshot is already
    /// terminal, e.g. because the plan was cancelled while a step was running.
    pub fn upsert(&self, mut plan: ExecutionPlan) -> bool {
        {
            let mut plans = self.plans.write();
            if plans.get(&plan.id).is_some_and(|p| p.status.is_terminal()) {
                return false;
            }
            plan.touch();
            plans.insert(plan.id, plan);
        }
        self.bump();
        true
    }

    /// Fail a non-terminal plan in place. Returns `false` if it was unknown or
    /// already terminal.
    pub fn mark_failed(&self, plan_id: Uuid, failure: PlanFailure) -> bool {
        {
            let mut plans = self.plans.write();
            let Some(plan) = plans.get_mut(&plan_id) else {
                return false;
            };
            if plan.status.is_terminal() {
                return false;
            }
            plan.status = PlanStatus::Failed;
            plan.failure = Some(failure);
            plan.updated_at = Utc::now();
        }
        self.bump();
        true
    }

    /// Drop `plan_id` and every failover plan that superseded it.
    ///
    /// Returns the number of snapshots removed.
    pub fn remove_chain(&self, plan_id: Uuid) -> usize {
        let removed = {
            let mut plans = self.plans.write();
            let mut removed = 0;
            let mut next = Some(plan_id);
            while let Some(id) = next {
                next = plans.remove(&id).and_then(|p| {
                    removed += 1;
                    p.superseded_by
                });
            }
            removed
        };
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn get(&self, plan_id: Uuid) -> Option<ExecutionPlan> {
        self.plans.read().get(&plan_id).cloned()
    }

    pub fn status(&self, plan_id: Uuid) -> Option<PlanStatus> {
        self.plans.read().get(&plan_id).map(|p| p.status)
    }

    pub fn count_with_status(&self, status: PlanStatus) -> usize {
        self.plans
            .read()
            .values()
            .filter(|p| p.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }

    /// Receiver that observes every later update.
    ///
    /// Subscribe before checking a condition, then await `changed()`; an
    /// update between the check and the await is not lost.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl Default for PlanBoard {
    fn default() -> Self {
        Self::new()
    }
}
