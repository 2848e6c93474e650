use chrono::{DateTime, Utc};
use conductor_core::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Health bucket derived from an agent's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// `> 0.8` is healthy, `> 0.6` degraded, anything else critical.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.8 {
            HealthStatus::Healthy
        } else if confidence > 0.6 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Capability descriptor for a registered worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    /// Steps currently bound to and running on this agent.
    #[serde(default)]
    pub current_load: u32,
}

fn default_confidence() -> f64 {
    1.0
}

fn default_max_concurrent_tasks() -> u32 {
    1
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            skills: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            priority: 0,
            confidence: default_confidence(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            current_load: 0,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills.extend(skills.into_iter().map(Into::into));
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Whether the agent lists `requirement` as a skill or a capability.
    pub fn advertises(&self, requirement: &str) -> bool {
        self.skills.contains(requirement) || self.capabilities.contains(requirement)
    }

    /// Ranking score: `priority × confidence`.
    pub fn score(&self) -> f64 {
        f64::from(self.priority) * self.confidence
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_confidence(self.confidence)
    }
}

/// Template family used by the plan compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Analysis step followed by an execution step.
    BusinessWorkflow,
    /// Analysis step followed by a report step.
    Analytical,
    /// One chained step per requirement.
    Pipeline,
    /// A single execution step.
    #[default]
    #[serde(other)]
    Generic,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::BusinessWorkflow => write!(f, "business-workflow"),
            TaskType::Analytical => write!(f, "analytical"),
            TaskType::Pipeline => write!(f, "pipeline"),
            TaskType::Generic => write!(f, "generic"),
        }
    }
}

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What a caller submits. The manager turns it into a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub context: Payload,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_type,
            description: description.into(),
            requirements: Vec::new(),
            priority: 0,
            deadline: None,
            dependencies: Vec::new(),
            context: Payload::new(),
        }
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_context(mut self, context: Payload) -> Self {
        self.context = context;
        self
    }
}

/// A submitted unit of work. Immutable apart from `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub description: String,
    pub requirements: Vec<String>,
    pub priority: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: Vec<Uuid>,
    pub context: Payload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, task_type: TaskType) -> Self {
        Self::from_request(TaskRequest::new(description, task_type))
    }

    pub fn from_request(request: TaskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: request.task_type,
            description: request.description,
            requirements: request.requirements,
            priority: request.priority,
            deadline: request.deadline,
            dependencies: request.dependencies,
            context: request.context,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// A pending task whose task-level dependencies are all in `completed_ids`.
    pub fn is_ready(&self, completed_ids: &[Uuid]) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One agent-bound, skill-bound unit of work within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Plan-local, 1-based. Dependencies refer to these numbers.
    pub step_number: u32,
    pub description: String,
    pub agent_id: String,
    pub skill: String,
    pub parameters: Payload,
    pub dependencies: Vec<u32>,
    pub status: StepStatus,
    pub result: Option<Payload>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub estimated_duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    pub fn new(
        step_number: u32,
        description: impl Into<String>,
        agent_id: impl Into<String>,
        skill: impl Into<String>,
    ) -> Self {
        Self {
            step_number,
            description: description.into(),
            agent_id: agent_id.into(),
            skill: skill.into(),
            parameters: Payload::new(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            estimated_duration_ms: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<u32>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_estimate(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    /// Back to `pending`, dropping any previous outcome.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.attempts = 0;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Status of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

/// Why a plan ended up `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFailure {
    pub message: String,
    pub step_number: Option<u32>,
    pub agent_id: Option<String>,
}

impl PlanFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step_number: None,
            agent_id: None,
        }
    }

    pub fn at_step(mut self, step: &ExecutionStep) -> Self {
        self.step_number = Some(step.step_number);
        self.agent_id = Some(step.agent_id.clone());
        self
    }
}

impl std::fmt::Display for PlanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.step_number, &self.agent_id) {
            (Some(step), Some(agent)) => {
                write!(f, "{} (step {step}, agent {agent})", self.message)
            }
            (Some(step), None) => write!(f, "{} (step {step})", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// The compiled, ordered, dependency-annotated steps for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub steps: Vec<ExecutionStep>,
    pub estimated_duration_ms: u64,
    pub complexity_score: f64,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub recovery_attempts: u32,
    /// The plan this one was failed over from.
    #[serde(default)]
    pub origin: Option<Uuid>,
    /// The failover clone that replaced this plan.
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    #[serde(default)]
    pub failure: Option<PlanFailure>,
}

impl ExecutionPlan {
    pub fn new(task_id: Uuid, task_type: TaskType, steps: Vec<ExecutionStep>) -> Self {
        let now = Utc::now();
        let estimated_duration_ms = steps.iter().map(|s| s.estimated_duration_ms).sum();
        Self {
            id: Uuid::new_v4(),
            task_id,
            task_type,
            steps,
            estimated_duration_ms,
            complexity_score: 0.0,
            status: PlanStatus::Pending,
            created_at: now,
            updated_at: now,
            recovery_attempts: 0,
            origin: None,
            superseded_by: None,
            failure: None,
        }
    }

    pub fn step(&self, step_number: u32) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn step_mut(&mut self, step_number: u32) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.step_number == step_number)
    }

    /// Step numbers in ascending order.
    pub fn step_order(&self) -> Vec<u32> {
        let mut order: Vec<u32> = self.steps.iter().map(|s| s.step_number).collect();
        order.sort_unstable();
        order
    }

    /// Percentage of completed steps, `0..=100`.
    pub fn progress(&self) -> u8 {
        if self.steps.is_empty() {
            return if self.status == PlanStatus::Completed { 100 } else { 0 };
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        ((done * 100) / self.steps.len()) as u8
    }

    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    pub fn failed_steps(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_number)
            .collect()
    }

    /// True when every dependency points at an existing, lower-numbered step.
    ///
    /// That ordering alone makes the step graph acyclic.
    pub fn is_well_ordered(&self) -> bool {
        self.steps.iter().all(|step| {
            step.dependencies
                .iter()
                .all(|dep| *dep < step.step_number && self.step(*dep).is_some())
        })
    }

    /// Output of the last completed step, used as the plan result.
    pub fn final_result(&self) -> Option<&Payload> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
