use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, Payload, PayloadKind, PayloadSchema};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything a skill handler needs to run one attempt of one step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub plan_id: Uuid,
    pub task_id: Uuid,
    pub step_number: u32,
    pub agent_id: String,
    pub skill: String,
    pub parameters: Payload,
    /// Results of the completed steps this step depends on, keyed by step number.
    pub upstream: BTreeMap<u32, Payload>,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Fired when the owning plan is cancelled. Handlers should stop early.
    pub cancellation: CancellationToken,
}

/// Resolves a skill name to something executable and runs it.
///
/// The engine wraps every call in its own timeout and retry loop, so an
/// implementation only has to report the outcome of a single attempt.
#[async_trait]
pub trait SkillDispatcher: Send + Sync {
    async fn dispatch(&self, invocation: &StepInvocation) -> ConductorResult<Payload>;
}

/// A handler for one named skill.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Shape the step parameters must have. Checked before every call.
    fn schema(&self) -> Option<PayloadSchema> {
        None
    }

    async fn handle(&self, invocation: &StepInvocation) -> ConductorResult<Payload>;
}

/// Dispatcher backed by a map of skill name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn SkillHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn SkillHandler>) {
        let name = handler.name().to_string();
        info!(skill = %name, "Registered skill handler");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn SkillHandler>> {
        self.handlers.get(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn skill_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl SkillDispatcher for HandlerRegistry {
    async fn dispatch(&self, invocation: &StepInvocation) -> ConductorResult<Payload> {
        let handler = self.handlers.get(&invocation.skill).ok_or_else(|| {
            ConductorError::NotFound(format!("no handler for skill '{}'", invocation.skill))
        })?;
        if let Some(schema) = handler.schema() {
            invocation.parameters.validate(&schema)?;
        }
        debug!(
            skill = %invocation.skill,
            agent = %invocation.agent_id,
            step = invocation.step_number,
            attempt = invocation.attempt,
            "Dispatching skill"
        );
        handler.handle(invocation).await
    }
}

/// Local stand-in for a real skill: waits, then reports what it was asked to do.
///
/// Agents listed in `failing_agents` always fail, which lets demos and tests
/// drive the recovery paths deterministically.
pub struct SimulatedSkill {
    name: String,
    delay: Duration,
    failing_agents: HashSet<String>,
}

impl SimulatedSkill {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            failing_agents: HashSet::new(),
        }
    }

    pub fn failing_for<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_agents
            .extend(agents.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl SkillHandler for SimulatedSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Option<PayloadSchema> {
        Some(
            PayloadSchema::new()
                .required("description", PayloadKind::Text)
                .optional("phase", PayloadKind::Text)
                .optional("context", PayloadKind::Map)
                .optional("requirements", PayloadKind::List),
        )
    }

    async fn handle(&self, invocation: &StepInvocation) -> ConductorResult<Payload> {
        tokio::select! {
            _ = invocation.cancellation.cancelled() => {
                return Err(ConductorError::Cancelled(format!(
                    "skill '{}' observed cancellation", self.name
                )));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        if self.failing_agents.contains(&invocation.agent_id) {
            return Err(ConductorError::Dispatch(format!(
                "agent '{}' could not perform '{}'",
                invocation.agent_id, self.name
            )));
        }

        let description = invocation
            .parameters
            .get_str("description")
            .unwrap_or("unnamed task");
        Ok(Payload::new()
            .with("skill", self.name.as_str())
            .with("agent", invocation.agent_id.as_str())
            .with("step", invocation.step_number)
            .with("consumed", invocation.upstream.len() as i64)
            .with(
                "summary",
                format!("{} handled '{description}'", invocation.agent_id),
            ))
    }
}
