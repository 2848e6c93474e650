use crate::config::{ManagerConfig, OrchestratorConfig};
use crate::dispatcher::SkillDispatcher;
use crate::engine::{ExecutionEngine, ExecutionSlot};
use crate::events::{EventBus, OrchestrationEvent};
use crate::history::{ExecutionHistory, HistoryEntry};
use crate::monitor::{AgentMonitor, EventCounters};
use crate::planner::PlanCompiler;
use crate::registry::CapabilityRegistry;
use crate::task_queue::PendingQueue;
use crate::types::{
    AgentProfile, ExecutionPlan, HealthStatus, PlanFailure, PlanStatus, Task, TaskRequest,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStatusReport {
    pub plan_id: Uuid,
    pub task_id: Uuid,
    pub status: PlanStatus,
    /// Completed steps as a percentage.
    pub progress: u8,
    pub last_update: DateTime<Utc>,
    pub error: Option<String>,
    pub failed_step: Option<u32>,
    pub superseded_by: Option<Uuid>,
}

impl PlanStatusReport {
    fn from_plan(plan: &ExecutionPlan) -> Self {
        Self {
            plan_id: plan.id,
            task_id: plan.task_id,
            status: plan.status,
            progress: plan.progress(),
            last_update: plan.updated_at,
            error: plan.failure.as_ref().map(ToString::to_string),
            failed_step: plan.failure.as_ref().and_then(|f| f.step_number),
            superseded_by: plan.superseded_by,
        }
    }
}

/// Aggregate health of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub active_executions: usize,
    pub queued_tasks: usize,
    pub registered_agents: usize,
    pub max_concurrent_agents: usize,
    /// `completed / (completed + failed)` over recorded history, `1.0` if empty.
    pub success_rate: f64,
    pub total_executions: usize,
    pub average_execution_ms: u64,
    pub healthy_agents: usize,
    pub degraded_agents: usize,
    pub critical_agents: usize,
    /// Populated by the background loop started with [`OrchestrationManager::start`].
    pub counters: EventCounters,
}

struct TaskRecord {
    task: Task,
    /// The plan compiled at submission; failover clones hang off it.
    plan_id: Uuid,
}

/// Front door of the orchestrator: accepts tasks, queues or launches their
/// plans, and reports on them.
///
/// Cloning is cheap; every clone drives the same registry, engine and queue.
#[derive(Clone)]
pub struct OrchestrationManager {
    config: Arc<ManagerConfig>,
    registry: Arc<CapabilityRegistry>,
    compiler: Arc<PlanCompiler>,
    engine: Arc<ExecutionEngine>,
    queue: Arc<Mutex<PendingQueue>>,
    tasks: Arc<RwLock<HashMap<Uuid, TaskRecord>>>,
    /// Finished task ids, oldest first. Pruned down to the history window.
    retired: Arc<Mutex<VecDeque<Uuid>>>,
    history: Arc<Mutex<ExecutionHistory>>,
    monitor: AgentMonitor,
    events: EventBus,
}

impl OrchestrationManager {
    /// Build the registry, compiler and engine from `config` and register its agents.
    pub fn new(
        config: OrchestratorConfig,
        dispatcher: Arc<dyn SkillDispatcher>,
    ) -> ConductorResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.manager.event_capacity);
        let registry = Arc::new(CapabilityRegistry::new(events.clone()));
        for agent in config.agents {
            registry.register(agent)?;
        }
        let compiler = Arc::new(PlanCompiler::new(
            Arc::clone(&registry),
            config.engine.max_concurrent_agents,
        ));
        let engine = Arc::new(ExecutionEngine::new(
            config.engine,
            Arc::clone(&registry),
            dispatcher,
            events.clone(),
        ));
        info!(
            agents = registry.agent_count(),
            max_concurrent = engine.max_concurrent_agents(),
            "Orchestration manager ready"
        );
        Ok(Self {
            history: Arc::new(Mutex::new(ExecutionHistory::new(
                config.manager.history_limit,
            ))),
            config: Arc::new(config.manager),
            registry,
            compiler,
            engine,
            queue: Arc::new(Mutex::new(PendingQueue::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            retired: Arc::new(Mutex::new(VecDeque::new())),
            monitor: AgentMonitor::new(),
            events,
        })
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    pub fn register_agent(&self, agent: AgentProfile) -> ConductorResult<()> {
        self.registry.register(agent)?;
        self.process_queue();
        Ok(())
    }

    pub fn unregister_agent(&self, agent_id: &str) -> ConductorResult<AgentProfile> {
        self.registry.unregister(agent_id)
    }

    /// Compile a task and either start it or queue it. Returns the plan id.
    ///
    /// Unknown task dependencies and unsatisfiable requirements are rejected
    /// before anything is stored.
    pub fn submit_task(&self, request: TaskRequest) -> ConductorResult<Uuid> {
        {
            let tasks = self.tasks.read();
            if let Some(unknown) = request.dependencies.iter().find(|d| !tasks.contains_key(*d)) {
                return Err(ConductorError::Validation(format!(
                    "unknown task dependency {unknown}"
                )));
            }
        }

        let task = Task::from_request(request);
        let plan = self.compiler.create_plan(&task)?;
        let (task_id, plan_id) = (task.id, plan.id);

        self.engine.board().upsert(plan.clone());
        self.tasks.write().insert(
            task_id,
            TaskRecord {
                task: task.clone(),
                plan_id,
            },
        );

        if task.priority >= self.config.high_priority_threshold
            && self.dependencies_completed(&task)
        {
            match self.engine.reserve(plan_id) {
                Ok(slot) => {
                    info!(
                        task_id = %task_id,
                        plan_id = %plan_id,
                        priority = task.priority,
                        "Executing high-priority task immediately"
                    );
                    self.launch(task_id, plan, slot);
                    return Ok(plan_id);
                }
                Err(e) => debug!(plan_id = %plan_id, error = %e, "No free slot, queueing"),
            }
        }

        let priority = task.priority;
        self.queue.lock().push(task, plan);
        self.events.publish(OrchestrationEvent::TaskQueued {
            task_id,
            plan_id,
            priority,
        });
        debug!(task_id = %task_id, plan_id = %plan_id, priority, "Task queued");
        Ok(plan_id)
    }

    /// Start as many queued plans as slots and dependencies allow.
    ///
    /// Queued tasks whose dependency failed are failed here. Returns the
    /// number of plans started.
    pub fn process_queue(&self) -> usize {
        let mut started = 0;
        loop {
            let (completed, failed) = self.task_outcomes();
            let mut queue = self.queue.lock();

            for task_id in queue.blocked_by(&failed) {
                if let Some(entry) = queue.remove(task_id) {
                    let message = "a task dependency failed";
                    self.fail_queued(&entry.task, &entry.plan, message);
                }
            }

            if !self.engine.has_capacity() {
                break;
            }
            let Some(plan_id) = queue.next_ready(&completed).map(|e| e.plan.id) else {
                break;
            };
            let Ok(slot) = self.engine.reserve(plan_id) else {
                break;
            };
            let Some(entry) = queue.remove_plan(plan_id) else {
                break;
            };
            drop(queue);

            debug!(task_id = %entry.task.id, plan_id = %plan_id, "Dequeued task");
            self.launch(entry.task.id, entry.plan, slot);
            started += 1;
        }
        self.prune();
        started
    }

    /// Forget finished tasks that fell out of the history window, along with
    /// their plans. Tasks a queued task still depends on are kept and do not
    /// count against the window.
    fn prune(&self) {
        let limit = self.config.history_limit;
        if self.retired.lock().len() <= limit {
            return;
        }
        let pinned = self.queue.lock().dependencies();
        let mut evicted = Vec::new();
        {
            let mut retired = self.retired.lock();
            let unpinned = retired.iter().filter(|id| !pinned.contains(*id)).count();
            let mut excess = unpinned.saturating_sub(limit);
            retired.retain(|id| {
                if excess > 0 && !pinned.contains(id) {
                    excess -= 1;
                    evicted.push(*id);
                    false
                } else {
                    true
                }
            });
        }
        if evicted.is_empty() {
            return;
        }

        let mut tasks = self.tasks.write();
        let mut plans = 0;
        for task_id in &evicted {
            if let Some(record) = tasks.remove(task_id) {
                plans += self.engine.board().remove_chain(record.plan_id);
            }
        }
        debug!(tasks = evicted.len(), plans, "Pruned finished tasks");
    }

    fn fail_queued(&self, task: &Task, plan: &ExecutionPlan, message: &str) {
        if self
            .engine
            .board()
            .mark_failed(plan.id, PlanFailure::new(message))
        {
            self.events.publish(OrchestrationEvent::ExecutionFailed {
                task_id: task.id,
                plan_id: plan.id,
                error: message.to_string(),
            });
        }
        if let Some(record) = self.tasks.write().get_mut(&task.id) {
            record.task.status = TaskStatus::Failed;
        }
        self.retired.lock().push_back(task.id);
        warn!(task_id = %task.id, plan_id = %plan.id, reason = message, "Queued task failed");
    }

    fn launch(&self, task_id: Uuid, plan: ExecutionPlan, slot: ExecutionSlot) {
        if let Some(record) = self.tasks.write().get_mut(&task_id) {
            record.task.status = TaskStatus::Running;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let finished = this.engine.execute_reserved(plan, slot).await;
            this.finish(task_id, finished, started.elapsed());
        });
    }

    fn finish(&self, task_id: Uuid, plan: ExecutionPlan, elapsed: Duration) {
        // A cancelled plan keeps the snapshot written at cancellation.
        let recorded = self.engine.board().get(plan.id).unwrap_or(plan);
        self.history
            .lock()
            .push(HistoryEntry::from_plan(&recorded, elapsed.as_millis() as u64));
        if let Some(record) = self.tasks.write().get_mut(&task_id) {
            record.task.status = match recorded.status {
                PlanStatus::Completed => TaskStatus::Completed,
                _ => TaskStatus::Failed,
            };
        }
        self.retired.lock().push_back(task_id);
        self.process_queue();
    }

    /// Follow failover supersession to the newest plan in the chain.
    fn resolve(&self, plan_id: Uuid) -> Uuid {
        let board = self.engine.board();
        let mut current = plan_id;
        while let Some(next) = board.get(current).and_then(|p| p.superseded_by) {
            if board.get(next).is_none() {
                break;
            }
            current = next;
        }
        current
    }

    /// Ids of tasks whose newest plan completed, and of those that failed.
    fn task_outcomes(&self) -> (Vec<Uuid>, Vec<Uuid>) {
        let tasks = self.tasks.read();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (task_id, record) in tasks.iter() {
            let plan = self.engine.board().get(self.resolve(record.plan_id));
            match plan {
                Some(p) if p.status == PlanStatus::Completed => completed.push(*task_id),
                Some(p) if p.status == PlanStatus::Failed && p.superseded_by.is_none() => {
                    failed.push(*task_id)
                }
                _ => {}
            }
        }
        (completed, failed)
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        if task.dependencies.is_empty() {
            return true;
        }
        let (completed, _) = self.task_outcomes();
        task.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Status of a task as last recorded by the manager.
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks.read().get(&task_id).map(|r| r.task.status)
    }

    pub fn get_plan_status(&self, plan_id: Uuid) -> ConductorResult<PlanStatusReport> {
        self.engine
            .board()
            .get(plan_id)
            .map(|p| PlanStatusReport::from_plan(&p))
            .ok_or_else(|| ConductorError::NotFound(format!("plan {plan_id}")))
    }

    /// Wait until `plan_id`, or the failover plan that replaced it, is terminal.
    pub async fn await_plan(
        &self,
        plan_id: Uuid,
        timeout: Duration,
    ) -> ConductorResult<PlanStatusReport> {
        let board = self.engine.board();
        let mut rx = board.subscribe();
        let wait = async {
            loop {
                let current = self.resolve(plan_id);
                let plan = board
                    .get(current)
                    .ok_or_else(|| ConductorError::NotFound(format!("plan {plan_id}")))?;
                if plan.status.is_terminal() && plan.superseded_by.is_none() {
                    return Ok(PlanStatusReport::from_plan(&plan));
                }
                rx.changed()
                    .await
                    .map_err(|_| ConductorError::Orchestrator("plan board closed".into()))?;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ConductorError::Timeout(format!(
                "plan {plan_id} not finished after {} ms",
                timeout.as_millis()
            ))
        })?
    }

    /// Cancel a queued or running plan.
    pub fn cancel_plan(&self, plan_id: Uuid) -> ConductorResult<()> {
        let queued = self.queue.lock().remove_plan(plan_id);
        if let Some(entry) = queued {
            self.fail_queued(&entry.task, &entry.plan, "plan was cancelled");
            return Ok(());
        }

        let current = self.resolve(plan_id);
        match self.engine.cancel(current) {
            Ok(()) => {
                self.process_queue();
                Ok(())
            }
            Err(ConductorError::NotFound(_)) => match self.engine.board().status(current) {
                Some(status) if status.is_terminal() => Err(ConductorError::Validation(
                    format!("plan {plan_id} already finished"),
                )),
                _ => Err(ConductorError::NotFound(format!("plan {plan_id}"))),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let (success_rate, total_executions, average_execution_ms) = {
            let history = self.history.lock();
            (
                history.success_rate(),
                history.len(),
                history.average_elapsed_ms(),
            )
        };
        let agents = self.registry.agents();
        let count = |h: HealthStatus| agents.iter().filter(|a| a.health() == h).count();
        SystemHealth {
            active_executions: self.engine.active_count(),
            queued_tasks: self.queue.lock().len(),
            registered_agents: agents.len(),
            max_concurrent_agents: self.engine.max_concurrent_agents(),
            success_rate,
            total_executions,
            average_execution_ms,
            healthy_agents: count(HealthStatus::Healthy),
            degraded_agents: count(HealthStatus::Degraded),
            critical_agents: count(HealthStatus::Critical),
            counters: self.monitor.counters().await,
        }
    }

    /// Most recent history entries first.
    pub fn recent_history(&self, n: usize) -> Vec<HistoryEntry> {
        self.history.lock().recent(n)
    }

    /// Nudge the engine's concurrency limit by one step based on the success rate.
    ///
    /// Returns the new limit when it changed.
    pub fn tune(&self) -> Option<usize> {
        let (samples, success_rate) = {
            let history = self.history.lock();
            (history.len(), history.success_rate())
        };
        if samples < self.config.tuning_min_samples {
            debug!(
                samples,
                needed = self.config.tuning_min_samples,
                "Not enough history to tune"
            );
            return None;
        }

        let previous = self.engine.max_concurrent_agents();
        let target = if success_rate < self.config.low_success_threshold {
            previous.saturating_sub(1).max(self.config.min_concurrency)
        } else if success_rate > self.config.high_success_threshold {
            (previous + 1).min(self.config.max_concurrency)
        } else {
            previous
        };
        if target == previous {
            return None;
        }

        self.engine.set_max_concurrent_agents(target);
        self.compiler.set_max_candidates(target);
        self.events.publish(OrchestrationEvent::ConcurrencyTuned {
            previous,
            current: target,
            success_rate,
        });
        info!(previous, current = target, success_rate, "Concurrency tuned");
        Some(target)
    }

    /// Spawn the background loop: drain the queue and tune on every tick,
    /// fold events into the monitor.
    ///
    /// Returns the [`JoinHandle`] so the caller can abort it.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(this.config.tuning_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        this.process_queue();
                        if this.config.tuning_enabled {
                            this.tune();
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(event) => {
                            this.monitor.observe(&event).await;
                            if matches!(event, OrchestrationEvent::AgentRegistered { .. }) {
                                this.process_queue();
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Background loop lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}
