use crate::board::PlanBoard;
use crate::config::{EngineConfig, RecoveryMode};
use crate::dispatcher::{SkillDispatcher, StepInvocation};
use crate::events::{EventBus, OrchestrationEvent};
use crate::registry::CapabilityRegistry;
use crate::types::{ExecutionPlan, PlanFailure, PlanStatus, StepStatus};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Payload};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

type ActivePlans = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// One of the engine's concurrent execution slots.
///
/// Dropping the slot frees it. A failover moves the slot to the clone's id.
pub struct ExecutionSlot {
    plan_id: Uuid,
    token: CancellationToken,
    active: ActivePlans,
}

impl ExecutionSlot {
    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn rekey(&mut self, new_id: Uuid) {
        let mut active = self.active.lock();
        // A cancelled plan already gave its slot back.
        if active.remove(&self.plan_id).is_some() {
            active.insert(new_id, self.token.clone());
        }
        self.plan_id = new_id;
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.active.lock().remove(&self.plan_id);
    }
}

/// Runs compiled plans: dependency checks, dispatch with retry and backoff,
/// the configured recovery policy, and the engine-wide concurrency limit.
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    dispatcher: Arc<dyn SkillDispatcher>,
    config: RwLock<EngineConfig>,
    board: Arc<PlanBoard>,
    active: ActivePlans,
    events: EventBus,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        dispatcher: Arc<dyn SkillDispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config: RwLock::new(config),
            board: Arc::new(PlanBoard::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn board(&self) -> &Arc<PlanBoard> {
        &self.board
    }

    pub fn max_concurrent_agents(&self) -> usize {
        self.config.read().max_concurrent_agents
    }

    /// Change the concurrency limit. Running plans are never evicted; a lower
    /// limit only delays new starts.
    pub fn set_max_concurrent_agents(&self, max: usize) {
        let max = max.max(1);
        let mut config = self.config.write();
        if config.max_concurrent_agents != max {
            info!(
                from = config.max_concurrent_agents,
                to = max,
                "Engine concurrency limit changed"
            );
            config.max_concurrent_agents = max;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent_agents()
    }

    pub fn is_running(&self, plan_id: Uuid) -> bool {
        self.active.lock().contains_key(&plan_id)
    }

    /// Claim a slot for `plan_id`, or refuse if the limit is reached.
    pub fn reserve(&self, plan_id: Uuid) -> ConductorResult<ExecutionSlot> {
        let max = self.max_concurrent_agents();
        let mut active = self.active.lock();
        if active.len() >= max {
            return Err(ConductorError::Capacity(format!(
                "{} plans already running (limit {max})",
                active.len()
            )));
        }
        let token = CancellationToken::new();
        active.insert(plan_id, token.clone());
        Ok(ExecutionSlot {
            plan_id,
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Cancel a running plan.
    ///
    /// The plan is marked failed and its slot freed at once. A dispatch that is
    /// already in flight is left to finish or to observe the token.
    pub fn cancel(&self, plan_id: Uuid) -> ConductorResult<()> {
        let token = self
            .active
            .lock()
            .remove(&plan_id)
            .ok_or_else(|| ConductorError::NotFound(format!("running plan {plan_id}")))?;
        token.cancel();
        if self
            .board
            .mark_failed(plan_id, PlanFailure::new("plan was cancelled"))
        {
            if let Some(plan) = self.board.get(plan_id) {
                self.events.publish(OrchestrationEvent::ExecutionFailed {
                    task_id: plan.task_id,
                    plan_id,
                    error: "plan was cancelled".into(),
                });
            }
        }
        warn!(plan_id = %plan_id, "Plan cancelled");
        Ok(())
    }

    /// Run `plan` to a terminal state.
    ///
    /// Refuses with a capacity error when the engine is full. Otherwise the
    /// returned plan is terminal; it may be a failover clone of the input.
    pub async fn execute_plan(&self, plan: ExecutionPlan) -> ConductorResult<ExecutionPlan> {
        let slot = self.reserve(plan.id)?;
        Ok(self.execute_reserved(plan, slot).await)
    }

    /// Run `plan` in a slot obtained from [`reserve`](Self::reserve).
    pub async fn execute_reserved(
        &self,
        mut plan: ExecutionPlan,
        mut slot: ExecutionSlot,
    ) -> ExecutionPlan {
        let started = Instant::now();
        plan.status = PlanStatus::Running;
        self.board.upsert(plan.clone());
        self.events.publish(OrchestrationEvent::ExecutionStarted {
            task_id: plan.task_id,
            plan_id: plan.id,
        });
        info!(
            plan_id = %plan.id,
            task_id = %plan.task_id,
            steps = plan.steps.len(),
            "Execution started"
        );

        loop {
            let err = match self.run_steps(&mut plan, &slot.token).await {
                Ok(()) => {
                    plan.status = PlanStatus::Completed;
                    plan.touch();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if self.board.upsert(plan.clone()) {
                        self.events.publish(OrchestrationEvent::ExecutionCompleted {
                            task_id: plan.task_id,
                            plan_id: plan.id,
                            elapsed_ms,
                        });
                    }
                    info!(plan_id = %plan.id, elapsed_ms, "Execution completed");
                    return plan;
                }
                Err(err) => err,
            };

            let mut failure = self.failure_for(&plan, &err);
            let config = self.config();
            let recoverable = matches!(err, ConductorError::StepFailed { .. })
                && !slot.is_cancelled()
                && plan.recovery_attempts < config.max_recovery_attempts;

            if recoverable {
                match self.recover(&mut plan, &mut slot, &config, &failure).await {
                    Ok(()) => continue,
                    Err(recovery_err) => {
                        warn!(
                            plan_id = %plan.id,
                            mode = %config.recovery_mode,
                            error = %recovery_err,
                            "Recovery failed"
                        );
                        failure.message = format!("{}; {recovery_err}", failure.message);
                    }
                }
            } else if matches!(err, ConductorError::DependencyNotSatisfied { .. }) {
                error!(plan_id = %plan.id, error = %err, "Dependency invariant violated");
            }

            plan.status = PlanStatus::Failed;
            plan.failure = Some(failure.clone());
            plan.touch();
            if self.board.upsert(plan.clone()) {
                self.events.publish(OrchestrationEvent::ExecutionFailed {
                    task_id: plan.task_id,
                    plan_id: plan.id,
                    error: failure.to_string(),
                });
            }
            error!(plan_id = %plan.id, error = %failure, "Execution failed");
            return plan;
        }
    }

    fn failure_for(&self, plan: &ExecutionPlan, err: &ConductorError) -> PlanFailure {
        let failing_step = match err {
            ConductorError::StepFailed { step, .. } => Some(*step),
            ConductorError::DependencyNotSatisfied { step, .. } => Some(*step),
            _ => plan
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| s.step_number),
        };
        let failure = PlanFailure::new(err.to_string());
        match failing_step.and_then(|n| plan.step(n)) {
            Some(step) => failure.at_step(step),
            None => failure,
        }
    }

    /// Run every not-yet-completed step in ascending order.
    async fn run_steps(
        &self,
        plan: &mut ExecutionPlan,
        token: &CancellationToken,
    ) -> ConductorResult<()> {
        for step_number in plan.step_order() {
            if token.is_cancelled() {
                return Err(ConductorError::Cancelled(format!("plan {}", plan.id)));
            }
            let Some(step) = plan.step(step_number) else {
                continue;
            };
            if step.status == StepStatus::Completed {
                continue;
            }
            for dep in &step.dependencies {
                let satisfied = plan
                    .step(*dep)
                    .is_some_and(|d| d.status == StepStatus::Completed);
                if !satisfied {
                    return Err(ConductorError::DependencyNotSatisfied {
                        step: step_number,
                        dependency: *dep,
                    });
                }
            }
            self.execute_step(plan, step_number, token).await?;
        }
        Ok(())
    }

    /// Run one step with local retries and exponential backoff.
    async fn execute_step(
        &self,
        plan: &mut ExecutionPlan,
        step_number: u32,
        token: &CancellationToken,
    ) -> ConductorResult<()> {
        let config = self.config();
        let upstream: BTreeMap<u32, Payload> = plan
            .step(step_number)
            .map(|s| s.dependencies.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|dep| {
                plan.step(dep)
                    .and_then(|d| d.result.clone())
                    .map(|r| (dep, r))
            })
            .collect();

        let (plan_id, task_id) = (plan.id, plan.task_id);
        let mut invocation = {
            let step = plan
                .step_mut(step_number)
                .ok_or_else(|| ConductorError::NotFound(format!("step {step_number}")))?;
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            step.error = None;
            StepInvocation {
                plan_id,
                task_id,
                step_number,
                agent_id: step.agent_id.clone(),
                skill: step.skill.clone(),
                parameters: step.parameters.clone(),
                upstream,
                attempt: 0,
                cancellation: token.clone(),
            }
        };
        self.board.upsert(plan.clone());

        let max_attempts = config.retry_attempts.max(1);
        let started = Instant::now();
        let mut last_error: Option<ConductorError> = None;

        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                break;
            }
            invocation.attempt = attempt;
            self.events.publish(OrchestrationEvent::StepStarted {
                plan_id: plan.id,
                step_number,
                agent_id: invocation.agent_id.clone(),
                attempt,
            });

            let outcome = self.attempt(&invocation, &config).await;
            if let Some(step) = plan.step_mut(step_number) {
                step.attempts = attempt;
            }

            match outcome {
                Ok(result) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if let Some(step) = plan.step_mut(step_number) {
                        step.status = StepStatus::Completed;
                        step.result = Some(result);
                        step.completed_at = Some(Utc::now());
                    }
                    self.board.upsert(plan.clone());
                    self.events.publish(OrchestrationEvent::StepCompleted {
                        plan_id: plan.id,
                        step_number,
                        agent_id: invocation.agent_id.clone(),
                        elapsed_ms,
                    });
                    info!(
                        plan_id = %plan.id,
                        step = step_number,
                        agent = %invocation.agent_id,
                        attempt,
                        "Step completed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let retry = e.is_transient() && attempt < max_attempts;
                    warn!(
                        plan_id = %plan.id,
                        step = step_number,
                        agent = %invocation.agent_id,
                        attempt,
                        retry,
                        error = %e,
                        "Step attempt failed"
                    );
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                    let delay = config.backoff_for(attempt);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let cancelled = token.is_cancelled();
        let error = match (&last_error, cancelled) {
            (_, true) => "plan was cancelled".to_string(),
            (Some(e), false) => e.to_string(),
            (None, false) => "step made no attempts".to_string(),
        };
        if let Some(step) = plan.step_mut(step_number) {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            step.completed_at = Some(Utc::now());
        }
        self.board.upsert(plan.clone());
        self.events.publish(OrchestrationEvent::StepFailed {
            plan_id: plan.id,
            step_number,
            agent_id: invocation.agent_id.clone(),
            error: error.clone(),
        });

        if cancelled {
            Err(ConductorError::Cancelled(format!("plan {}", plan.id)))
        } else {
            Err(ConductorError::StepFailed {
                step: step_number,
                error,
            })
        }
    }

    /// One dispatch: take agent load, call the dispatcher, both under the timeout.
    ///
    /// A saturated agent is waited for rather than treated as a failed attempt.
    async fn attempt(
        &self,
        invocation: &StepInvocation,
        config: &EngineConfig,
    ) -> ConductorResult<Payload> {
        let call = async {
            let _load = self
                .registry
                .acquire_wait(&invocation.agent_id, &invocation.cancellation)
                .await?;
            self.dispatcher.dispatch(invocation).await
        };
        match tokio::time::timeout(config.step_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(ConductorError::Timeout(format!(
                "skill '{}' on agent '{}' exceeded {} ms",
                invocation.skill, invocation.agent_id, config.step_timeout_ms
            ))),
        }
    }

    /// Apply the configured recovery mode once.
    async fn recover(
        &self,
        plan: &mut ExecutionPlan,
        slot: &mut ExecutionSlot,
        config: &EngineConfig,
        failure: &PlanFailure,
    ) -> ConductorResult<()> {
        plan.recovery_attempts += 1;
        self.events.publish(OrchestrationEvent::RecoveryTriggered {
            plan_id: plan.id,
            mode: config.recovery_mode,
            attempt: plan.recovery_attempts,
        });
        warn!(
            plan_id = %plan.id,
            mode = %config.recovery_mode,
            attempt = plan.recovery_attempts,
            error = %failure,
            "Recovering failed plan"
        );

        match config.recovery_mode {
            RecoveryMode::Retry => {
                tokio::select! {
                    _ = slot.token.cancelled() => {
                        return Err(ConductorError::Cancelled(format!("plan {}", plan.id)));
                    }
                    _ = tokio::time::sleep(config.recovery_delay()) => {}
                }
                for step in &mut plan.steps {
                    step.reset();
                }
                self.board.upsert(plan.clone());
                Ok(())
            }
            RecoveryMode::Redistribute => {
                let mut rebinds = Vec::new();
                for step_number in plan.failed_steps() {
                    let Some(step) = plan.step(step_number) else {
                        continue;
                    };
                    let next = self
                        .registry
                        .candidates_for(&step.skill)
                        .into_iter()
                        .find(|a| a.id != step.agent_id && a.has_capacity())
                        .ok_or_else(|| {
                            ConductorError::Recovery(format!(
                                "no alternative agent for step {step_number} ('{}')",
                                step.skill
                            ))
                        })?;
                    rebinds.push((step_number, next.id));
                }
                let plan_id = plan.id;
                for (step_number, agent_id) in rebinds {
                    if let Some(step) = plan.step_mut(step_number) {
                        info!(
                            plan_id = %plan_id,
                            step = step_number,
                            from = %step.agent_id,
                            to = %agent_id,
                            "Redistributing step"
                        );
                        step.agent_id = agent_id;
                        step.reset();
                    }
                }
                self.board.upsert(plan.clone());
                Ok(())
            }
            RecoveryMode::Failover => {
                let mut clone = plan.clone();
                for step in &mut clone.steps {
                    let best = self
                        .registry
                        .candidates_for(&step.skill)
                        .into_iter()
                        .find(|a| a.has_capacity())
                        .ok_or_else(|| {
                            ConductorError::Recovery(format!(
                                "no available agent for step {} ('{}')",
                                step.step_number, step.skill
                            ))
                        })?;
                    step.agent_id = best.id;
                    step.reset();
                }
                let now = Utc::now();
                clone.id = Uuid::new_v4();
                clone.origin = Some(plan.id);
                clone.superseded_by = None;
                clone.failure = None;
                clone.status = PlanStatus::Running;
                clone.created_at = now;

                plan.status = PlanStatus::Failed;
                plan.superseded_by = Some(clone.id);
                plan.failure = Some(failure.clone());
                self.board.upsert(plan.clone());
                self.events.publish(OrchestrationEvent::FailoverTriggered {
                    original_plan_id: plan.id,
                    new_plan_id: clone.id,
                });
                info!(from = %plan.id, to = %clone.id, "Failing over to cloned plan");

                slot.rekey(clone.id);
                self.board.upsert(clone.clone());
                *plan = clone;
                Ok(())
            }
        }
    }
}
