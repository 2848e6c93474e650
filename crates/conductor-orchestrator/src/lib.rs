//! Task orchestration: capability registry, plan compiler, execution engine
//! and orchestration manager.
//!
//! Tasks are compiled against the agents registered in the
//! [`CapabilityRegistry`] into dependency-annotated [`ExecutionPlan`]s. The
//! [`ExecutionEngine`] runs plans step by step with retry, backoff and a
//! configurable recovery mode, and the [`OrchestrationManager`] queues tasks by
//! priority, tracks history and tunes concurrency from the observed success
//! rate.
//!
//! # Main types
//!
//! - [`OrchestrationManager`] — Submission, queueing, status and health.
//! - [`ExecutionEngine`] — Runs plans under a concurrency limit with recovery.
//! - [`PlanCompiler`] — Turns a [`Task`] into an [`ExecutionPlan`].
//! - [`CapabilityRegistry`] — Agents, their skills and their current load.
//! - [`SkillDispatcher`] — Seam through which steps reach real work.
//! - [`EventBus`] — Broadcast of [`OrchestrationEvent`]s.

/// Latest snapshot of every tracked plan.
pub mod board;
/// TOML-backed engine, manager and agent configuration.
pub mod config;
/// Skill dispatch trait, handler registry and simulated skills.
pub mod dispatcher;
/// Plan execution with retry, backoff and recovery.
pub mod engine;
/// Orchestration events and the broadcast bus.
pub mod events;
/// Bounded record of finished executions.
pub mod history;
/// Task submission, queueing, status, health and self-tuning.
pub mod manager;
/// Event-fed per-agent metrics.
pub mod monitor;
/// Task-type templates and plan compilation.
pub mod planner;
/// Agent registration, lookup, ranking and load accounting.
pub mod registry;
/// Priority queue of tasks waiting for a slot.
pub mod task_queue;
/// Shared orchestration types (Task, AgentProfile, ExecutionPlan, etc.).
pub mod types;

pub use board::PlanBoard;
pub use config::{EngineConfig, ManagerConfig, OrchestratorConfig, RecoveryMode};
pub use dispatcher::{
    HandlerRegistry, SimulatedSkill, SkillDispatcher, SkillHandler, StepInvocation,
};
pub use engine::{ExecutionEngine, ExecutionSlot};
pub use events::{EventBus, OrchestrationEvent};
pub use history::{ExecutionHistory, HistoryEntry};
pub use manager::{OrchestrationManager, PlanStatusReport, SystemHealth};
pub use monitor::{AgentMetrics, AgentMonitor, EventCounters};
pub use planner::{complexity_score, PlanCompiler};
pub use registry::{CapabilityRegistry, LoadGuard};
pub use task_queue::{PendingQueue, QueuedTask};
pub use types::{
    AgentProfile, ExecutionPlan, ExecutionStep, HealthStatus, PlanFailure, PlanStatus,
    StepStatus, Task, TaskRequest, TaskStatus, TaskType,
};
