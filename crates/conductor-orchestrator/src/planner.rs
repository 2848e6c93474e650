use crate::registry::CapabilityRegistry;
use crate::types::{AgentProfile, ExecutionPlan, ExecutionStep, Task, TaskType};
use chrono::{Duration, Utc};
use conductor_core::{ConductorError, ConductorResult, Payload, PayloadValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One phase of a task-type template.
struct Phase {
    name: &'static str,
    description: &'static str,
    estimate_ms: u64,
}

static ANALYSIS: Phase = Phase {
    name: "analysis",
    description: "Analyze requirements",
    estimate_ms: 2_000,
};
static EXECUTION: Phase = Phase {
    name: "execution",
    description: "Execute workflow",
    estimate_ms: 5_000,
};
static DATA_ANALYSIS: Phase = Phase {
    name: "analysis",
    description: "Analyze data",
    estimate_ms: 3_000,
};
static REPORT: Phase = Phase {
    name: "report",
    description: "Generate report",
    estimate_ms: 2_000,
};
static STAGE: Phase = Phase {
    name: "stage",
    description: "Run pipeline stage",
    estimate_ms: 2_000,
};
static SINGLE: Phase = Phase {
    name: "execution",
    description: "Execute task",
    estimate_ms: 3_000,
};

/// Phases for a task type, each paired with the earlier phases it consumes.
fn template(task: &Task) -> Vec<(&'static Phase, Vec<u32>)> {
    match task.task_type {
        TaskType::BusinessWorkflow => vec![(&ANALYSIS, vec![]), (&EXECUTION, vec![1])],
        TaskType::Analytical => vec![(&DATA_ANALYSIS, vec![]), (&REPORT, vec![1])],
        TaskType::Pipeline => {
            let stages = task.requirements.len().max(1) as u32;
            (1..=stages)
                .map(|n| {
                    let deps = if n == 1 { vec![] } else { vec![n - 1] };
                    (&STAGE, deps)
                })
                .collect()
        }
        TaskType::Generic => vec![(&SINGLE, vec![])],
    }
}

/// Bounded `0..=10` estimate of how demanding a task is.
///
/// 1.5 per requirement, 0.3 per priority point (priority clamped to 0..=10),
/// 1.0 per task dependency, plus 3.0 for a deadline under 24 hours or 1.5 under
/// 72 hours.
pub fn complexity_score(task: &Task) -> f64 {
    let mut score = 1.5 * task.requirements.len() as f64;
    score += 0.3 * f64::from(task.priority.clamp(0, 10));
    score += task.dependencies.len() as f64;
    if let Some(deadline) = task.deadline {
        let remaining = deadline - Utc::now();
        if remaining < Duration::hours(24) {
            score += 3.0;
        } else if remaining < Duration::hours(72) {
            score += 1.5;
        }
    }
    score.clamp(0.0, 10.0)
}

/// Compiles tasks into execution plans against the capability registry.
pub struct PlanCompiler {
    registry: Arc<CapabilityRegistry>,
    max_candidates: AtomicUsize,
}

impl PlanCompiler {
    pub fn new(registry: Arc<CapabilityRegistry>, max_candidates: usize) -> Self {
        Self {
            registry,
            max_candidates: AtomicUsize::new(max_candidates.max(1)),
        }
    }

    /// Follows the engine's concurrency limit when it is retuned.
    pub fn set_max_candidates(&self, max: usize) {
        self.max_candidates.store(max.max(1), Ordering::Relaxed);
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates.load(Ordering::Relaxed)
    }

    /// Build a plan for `task`, or fail before anything is created.
    pub fn create_plan(&self, task: &Task) -> ConductorResult<ExecutionPlan> {
        self.validate(task)?;

        let mut candidates = self.registry.find_all_matching(&task.requirements);
        candidates.truncate(self.max_candidates());
        if candidates.is_empty() {
            return Err(ConductorError::Validation(
                "no registered agent can serve this task".into(),
            ));
        }

        let phases = template(task);
        let mut steps = Vec::with_capacity(phases.len());
        for (index, (phase, deps)) in phases.into_iter().enumerate() {
            let step_number = index as u32 + 1;
            let (agent, skill) = self.bind(task, index, &candidates)?;
            let mut parameters = Payload::new()
                .with("description", task.description.as_str())
                .with("phase", phase.name);
            if !task.context.is_empty() {
                parameters.insert("context", PayloadValue::from(task.context.clone()));
            }
            if task.task_type == TaskType::Generic && task.requirements.len() > 1 {
                parameters.insert("requirements", task.requirements.clone());
            }
            debug!(
                step = step_number,
                agent = %agent.id,
                skill = %skill,
                "Bound plan step"
            );
            steps.push(
                ExecutionStep::new(
                    step_number,
                    format!("{}: {}", phase.description, task.description),
                    agent.id.clone(),
                    skill,
                )
                .with_dependencies(deps)
                .with_parameters(parameters)
                .with_estimate(phase.estimate_ms),
            );
        }

        let mut plan = ExecutionPlan::new(task.id, task.task_type, steps);
        plan.complexity_score = complexity_score(task);

        if !plan.is_well_ordered() {
            return Err(ConductorError::Orchestrator(format!(
                "compiled plan for task {} contains a forward dependency",
                task.id
            )));
        }

        info!(
            plan_id = %plan.id,
            task_id = %task.id,
            task_type = %task.task_type,
            steps = plan.steps.len(),
            estimated_ms = plan.estimated_duration_ms,
            complexity = plan.complexity_score,
            "Compiled execution plan"
        );
        Ok(plan)
    }

    fn validate(&self, task: &Task) -> ConductorResult<()> {
        let missing = self.registry.unsatisfied(&task.requirements);
        if !missing.is_empty() {
            return Err(ConductorError::Validation(format!(
                "no registered agent advertises: {}",
                missing.join(", ")
            )));
        }
        if task.requirements.is_empty() && self.registry.agent_count() == 0 {
            return Err(ConductorError::Validation("no agents are registered".into()));
        }
        Ok(())
    }

    /// Choose the agent and skill for the phase at `index`.
    ///
    /// The skill cycles through the requirements; the agent is picked
    /// round-robin among the matched candidates advertising that skill. A
    /// single-step generic task prefers the best candidate covering every
    /// requirement.
    fn bind(
        &self,
        task: &Task,
        index: usize,
        candidates: &[AgentProfile],
    ) -> ConductorResult<(AgentProfile, String)> {
        if task.requirements.is_empty() {
            let agent = &candidates[index % candidates.len()];
            let skill = agent
                .skills
                .iter()
                .next()
                .or_else(|| agent.capabilities.iter().next())
                .cloned()
                .ok_or_else(|| {
                    ConductorError::Validation(format!(
                        "agent '{}' advertises no skills",
                        agent.id
                    ))
                })?;
            return Ok((agent.clone(), skill));
        }

        let skill = &task.requirements[index % task.requirements.len()];
        if task.task_type == TaskType::Generic && task.requirements.len() > 1 {
            let covering = candidates
                .iter()
                .find(|a| task.requirements.iter().all(|r| a.advertises(r)));
            if let Some(agent) = covering {
                return Ok((agent.clone(), skill.clone()));
            }
        }
        let able: Vec<&AgentProfile> = candidates.iter().filter(|a| a.advertises(skill)).collect();
        let agent = if able.is_empty() {
            // Every advertiser fell outside the candidate cap.
            self.registry.candidates_for(skill).into_iter().next()
        } else {
            Some(able[(index / task.requirements.len()) % able.len()].clone())
        };
        agent.map(|a| (a, skill.clone())).ok_or_else(|| {
            ConductorError::Validation(format!("no registered agent advertises: {skill}"))
        })
    }
}
