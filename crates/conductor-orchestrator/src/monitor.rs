use crate::events::OrchestrationEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Step-level metrics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub steps_started: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    /// Sum of completed step durations, retries included.
    pub busy_ms: u64,
    pub current_plan: Option<Uuid>,
    pub last_error: Option<String>,
}

/// System-wide counters derived from the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounters {
    pub tasks_queued: u64,
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub recoveries: u64,
    pub failovers: u64,
    pub tunings: u64,
}

#[derive(Default)]
struct MonitorState {
    agents: HashMap<String, AgentMetrics>,
    counters: EventCounters,
}

/// Folds [`OrchestrationEvent`]s into per-agent metrics and global counters.
#[derive(Clone, Default)]
pub struct AgentMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    pub async fn observe(&self, event: &OrchestrationEvent) {
        let mut state = self.state.write().await;
        match event {
            OrchestrationEvent::AgentRegistered { agent_id } => {
                state.agents.entry(agent_id.clone()).or_default();
            }
            OrchestrationEvent::AgentUnregistered { agent_id } => {
                state.agents.remove(agent_id);
            }
            OrchestrationEvent::TaskQueued { .. } => state.counters.tasks_queued += 1,
            OrchestrationEvent::ExecutionStarted { .. } => state.counters.executions_started += 1,
            OrchestrationEvent::ExecutionCompleted { .. } => {
                state.counters.executions_completed += 1;
            }
            OrchestrationEvent::ExecutionFailed { .. } => state.counters.executions_failed += 1,
            OrchestrationEvent::StepStarted {
                plan_id, agent_id, ..
            } => {
                let metrics = state.agents.entry(agent_id.clone()).or_default();
                metrics.steps_started += 1;
                metrics.current_plan = Some(*plan_id);
            }
            OrchestrationEvent::StepCompleted {
                agent_id,
                elapsed_ms,
                ..
            } => {
                let metrics = state.agents.entry(agent_id.clone()).or_default();
                metrics.steps_completed += 1;
                metrics.busy_ms += elapsed_ms;
                metrics.current_plan = None;
            }
            OrchestrationEvent::StepFailed {
                agent_id, error, ..
            } => {
                let metrics = state.agents.entry(agent_id.clone()).or_default();
                metrics.steps_failed += 1;
                metrics.last_error = Some(error.clone());
                metrics.current_plan = None;
            }
            OrchestrationEvent::RecoveryTriggered { .. } => state.counters.recoveries += 1,
            OrchestrationEvent::FailoverTriggered { .. } => state.counters.failovers += 1,
            OrchestrationEvent::ConcurrencyTuned { .. } => state.counters.tunings += 1,
        }
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// All agents, sorted by id.
    pub async fn snapshot(&self) -> Vec<(String, AgentMetrics)> {
        let state = self.state.read().await;
        let mut agents: Vec<(String, AgentMetrics)> = state
            .agents
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect();
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        agents
    }

    pub async fn counters(&self) -> EventCounters {
        self.state.read().await.counters.clone()
    }

    /// Sum over every agent.
    pub async fn aggregate(&self) -> AgentMetrics {
        let state = self.state.read().await;
        let mut total = AgentMetrics::default();
        for metrics in state.agents.values() {
            total.steps_started += metrics.steps_started;
            total.steps_completed += metrics.steps_completed;
            total.steps_failed += metrics.steps_failed;
            total.busy_ms += metrics.busy_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let agents: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .await
            .into_iter()
            .map(|(id, m)| (id, serde_json::to_value(m).unwrap_or_default()))
            .collect();
        serde_json::json!({
            "agents": agents,
            "aggregate": self.aggregate().await,
            "counters": self.counters().await,
        })
    }
}
