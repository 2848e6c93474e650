use crate::events::{EventBus, OrchestrationEvent};
use crate::types::{AgentProfile, HealthStatus};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reject descriptors the scheduler could never use.
pub(crate) fn validate_profile(agent: &AgentProfile) -> ConductorResult<()> {
    if agent.id.trim().is_empty() {
        return Err(ConductorError::Validation("agent id must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&agent.confidence) {
        return Err(ConductorError::Validation(format!(
            "agent '{}' confidence {} is outside [0, 1]",
            agent.id, agent.confidence
        )));
    }
    if agent.max_concurrent_tasks == 0 {
        return Err(ConductorError::Validation(format!(
            "agent '{}' must allow at least one concurrent task",
            agent.id
        )));
    }
    Ok(())
}

/// Orders agents by `priority × confidence` descending, ties by id ascending.
pub(crate) fn rank(a: &AgentProfile, b: &AgentProfile) -> Ordering {
    b.score()
        .partial_cmp(&a.score())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

/// Owns every agent descriptor and its load counter.
///
/// All mutation happens under one lock, so load increments and decrements from
/// concurrently running plans never interleave.
pub struct CapabilityRegistry {
    agents: RwLock<HashMap<String, AgentProfile>>,
    /// Woken whenever load is released or the agent set changes.
    released: Notify,
    events: EventBus,
}

impl CapabilityRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            released: Notify::new(),
            events,
        }
    }

    /// Register an agent. Re-registering an id replaces the descriptor but
    /// keeps its current load.
    pub fn register(&self, mut agent: AgentProfile) -> ConductorResult<()> {
        validate_profile(&agent)?;
        let agent_id = agent.id.clone();
        {
            let mut agents = self.agents.write();
            agent.current_load = agents.get(&agent_id).map_or(0, |a| a.current_load);
            info!(
                agent = %agent_id,
                skills = agent.skills.len(),
                capabilities = agent.capabilities.len(),
                priority = agent.priority,
                confidence = agent.confidence,
                "Registered agent"
            );
            agents.insert(agent_id.clone(), agent);
        }
        // A replacement descriptor may raise the agent's limit.
        self.released.notify_waiters();
        self.events
            .publish(OrchestrationEvent::AgentRegistered { agent_id });
        Ok(())
    }

    pub fn unregister(&self, agent_id: &str) -> ConductorResult<AgentProfile> {
        let removed = self
            .agents
            .write()
            .remove(agent_id)
            .ok_or_else(|| ConductorError::NotFound(format!("agent '{agent_id}'")))?;
        info!(agent = %agent_id, "Unregistered agent");
        self.released.notify_waiters();
        self.events.publish(OrchestrationEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(removed)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    /// Every registered agent, ranked.
    pub fn agents(&self) -> Vec<AgentProfile> {
        let mut all: Vec<AgentProfile> = self.agents.read().values().cloned().collect();
        all.sort_by(rank);
        all
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    pub fn update_priority(&self, agent_id: &str, priority: i32) -> ConductorResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::NotFound(format!("agent '{agent_id}'")))?;
        debug!(agent = %agent_id, from = agent.priority, to = priority, "Updated agent priority");
        agent.priority = priority;
        Ok(())
    }

    /// Agents whose `skills` contain `skill`, ranked.
    pub fn find_by_skill(&self, skill: &str) -> Vec<AgentProfile> {
        self.filtered(|a| a.skills.contains(skill))
    }

    /// Agents advertising `requirement` as a skill or capability, ranked.
    pub fn candidates_for(&self, requirement: &str) -> Vec<AgentProfile> {
        self.filtered(|a| a.advertises(requirement))
    }

    /// Agents advertising at least one of `requirements`, ranked.
    ///
    /// An empty requirement list matches every agent. An empty result means
    /// nothing can serve the task at all.
    pub fn find_all_matching(&self, requirements: &[String]) -> Vec<AgentProfile> {
        if requirements.is_empty() {
            return self.agents();
        }
        self.filtered(|a| requirements.iter().any(|r| a.advertises(r)))
    }

    /// Requirements no registered agent advertises.
    pub fn unsatisfied(&self, requirements: &[String]) -> Vec<String> {
        let agents = self.agents.read();
        requirements
            .iter()
            .filter(|r| !agents.values().any(|a| a.advertises(r)))
            .cloned()
            .collect()
    }

    pub fn health_status(&self, agent_id: &str) -> Option<HealthStatus> {
        self.agents.read().get(agent_id).map(AgentProfile::health)
    }

    pub fn load(&self, agent_id: &str) -> Option<u32> {
        self.agents.read().get(agent_id).map(|a| a.current_load)
    }

    /// Total load across all agents.
    pub fn total_load(&self) -> u32 {
        self.agents.read().values().map(|a| a.current_load).sum()
    }

    /// Reserve one unit of load on `agent_id`.
    ///
    /// The returned guard gives the unit back when dropped.
    pub fn acquire(self: &Arc<Self>, agent_id: &str) -> ConductorResult<LoadGuard> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::NotFound(format!("agent '{agent_id}'")))?;
        if !agent.has_capacity() {
            return Err(ConductorError::Capacity(format!(
                "agent '{agent_id}' is at its limit of {} concurrent tasks",
                agent.max_concurrent_tasks
            )));
        }
        agent.current_load += 1;
        Ok(LoadGuard {
            registry: Arc::clone(self),
            agent_id: agent_id.to_string(),
        })
    }

    /// Like [`acquire`](Self::acquire), but waits while the agent is at its
    /// limit instead of refusing.
    ///
    /// Fails with `NotFound` if the agent is (or becomes) unregistered and with
    /// `Cancelled` once `cancel` fires.
    pub async fn acquire_wait(
        self: &Arc<Self>,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> ConductorResult<LoadGuard> {
        let mut waited = false;
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.released.notified();
            match self.acquire(agent_id) {
                Err(ConductorError::Capacity(reason)) => {
                    if !waited {
                        debug!(agent = %agent_id, reason = %reason, "Waiting for agent capacity");
                        waited = true;
                    }
                }
                other => return other,
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ConductorError::Cancelled(format!(
                        "waiting for agent '{agent_id}'"
                    )));
                }
                _ = released => {}
            }
        }
    }

    fn release(&self, agent_id: &str) {
        // The agent may have been unregistered while the step ran.
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.current_load = agent.current_load.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    fn filtered(&self, predicate: impl Fn(&AgentProfile) -> bool) -> Vec<AgentProfile> {
        let mut matches: Vec<AgentProfile> = self
            .agents
            .read()
            .values()
            .filter(|a| predicate(a))
            .cloned()
            .collect();
        matches.sort_by(rank);
        matches
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

/// One unit of agent load, released on drop.
#[derive(Debug)]
pub struct LoadGuard {
    registry: Arc<CapabilityRegistry>,
    agent_id: String,
}

impl LoadGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.release(&self.agent_id);
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("agents", &self.agent_count())
            .finish()
    }
}
