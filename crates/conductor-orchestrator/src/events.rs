use crate::config::RecoveryMode;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notification published by the registry, engine and manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    AgentRegistered {
        agent_id: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    TaskQueued {
        task_id: Uuid,
        plan_id: Uuid,
        priority: i32,
    },
    ExecutionStarted {
        task_id: Uuid,
        plan_id: Uuid,
    },
    ExecutionCompleted {
        task_id: Uuid,
        plan_id: Uuid,
        elapsed_ms: u64,
    },
    ExecutionFailed {
        task_id: Uuid,
        plan_id: Uuid,
        error: String,
    },
    StepStarted {
        plan_id: Uuid,
        step_number: u32,
        agent_id: String,
        attempt: u32,
    },
    StepCompleted {
        plan_id: Uuid,
        step_number: u32,
        agent_id: String,
        elapsed_ms: u64,
    },
    StepFailed {
        plan_id: Uuid,
        step_number: u32,
        agent_id: String,
        error: String,
    },
    RecoveryTriggered {
        plan_id: Uuid,
        mode: RecoveryMode,
        attempt: u32,
    },
    FailoverTriggered {
        original_plan_id: Uuid,
        new_plan_id: Uuid,
    },
    ConcurrencyTuned {
        previous: usize,
        current: usize,
        success_rate: f64,
    },
}

/// Best-effort, in-process fan-out of [`OrchestrationEvent`]s.
///
/// Publishing never fails: with no subscribers the event is dropped, and a
/// subscriber that falls more than `capacity` events behind skips ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        tracing::trace!(?event, "Publishing orchestration event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
