#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, Payload};
use conductor_orchestrator::{
    AgentProfile, CapabilityRegistry, EngineConfig, HandlerRegistry, ManagerConfig,
    OrchestrationEvent, OrchestrationManager, OrchestratorConfig, PlanStatus, RecoveryMode,
    SimulatedSkill, SkillDispatcher, StepInvocation, StepStatus, TaskRequest, TaskType,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn fast_engine(mode: RecoveryMode) -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        recovery_delay_ms: 0,
        recovery_mode: mode,
        ..EngineConfig::default()
    }
}

fn manager_with(
    engine: EngineConfig,
    agents: Vec<AgentProfile>,
    dispatcher: Arc<dyn SkillDispatcher>,
) -> OrchestrationManager {
    let config = OrchestratorConfig {
        engine,
        manager: ManagerConfig::default(),
        agents,
    };
    OrchestrationManager::new(config, dispatcher).unwrap()
}

fn simulated(skills: &[&str], failing: &[&str], delay: Duration) -> Arc<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    for skill in skills {
        handlers.register(Arc::new(
            SimulatedSkill::new(*skill, delay).failing_for(failing.iter().copied()),
        ));
    }
    Arc::new(handlers)
}

fn urgent(description: &str, requirements: &[&str]) -> TaskRequest {
    TaskRequest::new(description, TaskType::Generic)
        .with_requirements(requirements.iter().copied())
        .with_priority(10)
}

fn drain(rx: &mut broadcast::Receiver<OrchestrationEvent>) -> Vec<OrchestrationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Fails the first `failures` dispatches, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl SkillDispatcher for Flaky {
    async fn dispatch(&self, _: &StepInvocation) -> ConductorResult<Payload> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(ConductorError::Dispatch(format!("attempt {n} failed")))
        } else {
            Ok(Payload::new().with("attempt", n))
        }
    }
}

/// Records when each step starts and ends.
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<(u32, &'static str)>>,
}

#[async_trait]
impl SkillDispatcher for Recorder {
    async fn dispatch(&self, invocation: &StepInvocation) -> ConductorResult<Payload> {
        self.log.lock().push((invocation.step_number, "start"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.log.lock().push((invocation.step_number, "end"));
        Ok(Payload::new().with("upstream", invocation.upstream.len() as i64))
    }
}

#[tokio::test]
async fn test_single_reporting_agent_completes_immediately() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("reporter", "Reporter").with_skills(["reporting"])],
        simulated(&["reporting"], &[], Duration::ZERO),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager
        .submit_task(urgent("Weekly report", &["reporting"]))
        .unwrap();
    assert_eq!(manager.get_system_health().await.queued_tasks, 0);

    let report = manager.await_plan(plan_id, WAIT).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.progress, 100);

    let plan = manager.engine().board().get(plan_id).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].agent_id, "reporter");
    assert_eq!(plan.steps[0].skill, "reporting");

    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::TaskQueued { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestrationEvent::ExecutionCompleted { plan_id: p, .. } if *p == plan_id
    )));
}

#[tokio::test]
async fn test_unknown_skill_is_rejected_without_side_effects() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("reporter", "Reporter").with_skills(["reporting"])],
        simulated(&["reporting"], &[], Duration::ZERO),
    );

    let err = manager
        .submit_task(urgent("Impossible", &["nonexistent-skill"]))
        .unwrap_err();
    assert!(matches!(err, ConductorError::Validation(_)));
    assert!(err.to_string().contains("nonexistent-skill"));

    assert_eq!(manager.registry().total_load(), 0);
    assert_eq!(manager.registry().load("reporter"), Some(0));
    assert!(manager.engine().board().is_empty());
    let health = manager.get_system_health().await;
    assert_eq!(health.queued_tasks, 0);
    assert_eq!(health.active_executions, 0);
}

#[tokio::test]
async fn test_redistribute_rebinds_to_second_agent() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Redistribute),
        vec![
            AgentProfile::new("primary", "Primary")
                .with_skills(["analysis"])
                .with_priority(9),
            AgentProfile::new("backup", "Backup")
                .with_skills(["analysis"])
                .with_priority(3),
        ],
        simulated(&["analysis"], &["primary"], Duration::ZERO),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager
        .submit_task(urgent("Churn analysis", &["analysis"]))
        .unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.plan_id, plan_id);
    let plan = manager.engine().board().get(plan_id).unwrap();
    assert_eq!(plan.steps[0].agent_id, "backup");
    assert_eq!(plan.recovery_attempts, 1);

    let recoveries: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, OrchestrationEvent::RecoveryTriggered { .. }))
        .collect();
    assert_eq!(
        recoveries,
        vec![OrchestrationEvent::RecoveryTriggered {
            plan_id,
            mode: RecoveryMode::Redistribute,
            attempt: 1,
        }]
    );
}

#[tokio::test]
async fn test_step_succeeds_on_attempt_within_retry_limit() {
    let dispatcher = Arc::new(Flaky {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("worker", "Worker").with_skills(["x"])],
        dispatcher.clone(),
    );

    let plan_id = manager.submit_task(urgent("Flaky", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let plan = manager.engine().board().get(plan_id).unwrap();
    let step = &plan.steps[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 3);
    assert_eq!(step.result.as_ref().unwrap().get_i64("attempt"), Some(3));
    assert_eq!(plan.recovery_attempts, 0);
}

#[tokio::test]
async fn test_exhausted_retries_trigger_recovery_exactly_once() {
    let dispatcher = Arc::new(Flaky {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("worker", "Worker").with_skills(["x"])],
        dispatcher.clone(),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager.submit_task(urgent("Doomed", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.failed_step, Some(1));
    assert!(report.error.unwrap().contains("agent worker"));
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 6);

    let events = drain(&mut rx);
    let recoveries = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::RecoveryTriggered { .. }))
        .count();
    assert_eq!(recoveries, 1);
    assert_eq!(manager.registry().load("worker"), Some(0));
}

#[tokio::test]
async fn test_dependent_step_never_starts_before_its_prerequisite() {
    let recorder = Arc::new(Recorder::default());
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("ops", "Ops").with_skills(["analysis", "execution"])],
        recorder.clone(),
    );

    let plan_id = manager
        .submit_task(
            TaskRequest::new("Invoice run", TaskType::BusinessWorkflow)
                .with_requirements(["analysis", "execution"])
                .with_priority(9),
        )
        .unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let log = recorder.log.lock().clone();
    assert_eq!(log, vec![(1, "start"), (1, "end"), (2, "start"), (2, "end")]);

    let plan = manager.engine().board().get(plan_id).unwrap();
    assert_eq!(plan.steps[1].dependencies, vec![1]);
    assert_eq!(plan.steps[1].skill, "execution");
    assert_eq!(
        plan.steps[1].result.as_ref().unwrap().get_i64("upstream"),
        Some(1)
    );
}

#[tokio::test]
async fn test_success_rate_over_history() {
    let manager = manager_with(
        EngineConfig {
            max_recovery_attempts: 0,
            retry_attempts: 1,
            ..fast_engine(RecoveryMode::Retry)
        },
        vec![
            AgentProfile::new("good", "Good").with_skills(["ok"]),
            AgentProfile::new("bad", "Bad").with_skills(["broken"]),
        ],
        simulated(&["ok", "broken"], &["bad"], Duration::ZERO),
    );
    assert!((manager.get_system_health().await.success_rate - 1.0).abs() < f64::EPSILON);

    let mut plans = Vec::new();
    for requirement in ["ok", "ok", "ok", "broken"] {
        let plan_id = manager.submit_task(urgent("job", &[requirement])).unwrap();
        manager.await_plan(plan_id, WAIT).await.unwrap();
        plans.push(plan_id);
    }
    for _ in 0..100 {
        if manager.recent_history(10).len() == 4 {
            break;
        }
        tokio::task::yield_now().await;
    }

    let health = manager.get_system_health().await;
    assert_eq!(health.total_executions, 4);
    assert!((health.success_rate - 0.75).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_cancel_running_plan() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("slowpoke", "Slowpoke").with_skills(["slow"])],
        simulated(&["slow"], &[], Duration::from_secs(60)),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager.submit_task(urgent("Long job", &["slow"])).unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(OrchestrationEvent::StepStarted { .. }) = rx.recv().await {
                break;
            }
        }
    })
    .await
    .unwrap();

    manager.cancel_plan(plan_id).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("plan was cancelled"));
    assert_eq!(manager.engine().active_count(), 0);

    // The handler observes the token and the agent load is released.
    for _ in 0..100 {
        if manager.registry().load("slowpoke") == Some(0) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(manager.registry().load("slowpoke"), Some(0));
}

/// Fails every dispatch for the first plan it sees.
#[derive(Default)]
struct FirstPlanFails {
    first: Mutex<Option<Uuid>>,
}

#[async_trait]
impl SkillDispatcher for FirstPlanFails {
    async fn dispatch(&self, invocation: &StepInvocation) -> ConductorResult<Payload> {
        let first = *self.first.lock().get_or_insert(invocation.plan_id);
        if first == invocation.plan_id {
            Err(ConductorError::Dispatch("node lost".into()))
        } else {
            Ok(Payload::new().with("agent", invocation.agent_id.as_str()))
        }
    }
}

#[tokio::test]
async fn test_failover_runs_clone_and_supersedes_original() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Failover),
        vec![
            AgentProfile::new("primary", "Primary")
                .with_skills(["x"])
                .with_priority(9),
            AgentProfile::new("standby", "Standby")
                .with_skills(["x"])
                .with_priority(1),
        ],
        Arc::new(FirstPlanFails::default()),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager.submit_task(urgent("Failover", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    let original = manager.get_plan_status(plan_id).unwrap();
    assert_eq!(original.status, PlanStatus::Failed);
    assert_eq!(original.failed_step, Some(1));
    let clone_id = original.superseded_by.unwrap();
    assert_eq!(report.plan_id, clone_id);
    assert_eq!(report.status, PlanStatus::Completed);

    let clone = manager.engine().board().get(clone_id).unwrap();
    assert_eq!(clone.origin, Some(plan_id));
    assert_eq!(clone.task_id, original.task_id);
    assert_eq!(clone.steps[0].agent_id, "primary");

    let events = drain(&mut rx);
    assert!(events.contains(&OrchestrationEvent::FailoverTriggered {
        original_plan_id: plan_id,
        new_plan_id: clone_id,
    }));
    // The superseded plan is not reported as a failed execution.
    assert!(!events.iter().any(|e| matches!(
        e,
        OrchestrationEvent::ExecutionFailed { plan_id: p, .. } if *p == plan_id
    )));
}

#[tokio::test]
async fn test_queue_honours_priority_and_task_dependencies() {
    let manager = manager_with(
        EngineConfig {
            max_concurrent_agents: 1,
            max_recovery_attempts: 0,
            retry_attempts: 1,
            ..fast_engine(RecoveryMode::Retry)
        },
        vec![
            AgentProfile::new("good", "Good").with_skills(["ok"]),
            AgentProfile::new("bad", "Bad").with_skills(["broken"]),
        ],
        simulated(&["ok", "broken"], &["bad"], Duration::ZERO),
    );
    let mut rx = manager.subscribe();

    let low = manager
        .submit_task(TaskRequest::new("low", TaskType::Generic).with_requirements(["ok"]))
        .unwrap();
    let high = manager
        .submit_task(
            TaskRequest::new("high", TaskType::Generic)
                .with_requirements(["ok"])
                .with_priority(5),
        )
        .unwrap();
    let failing = manager
        .submit_task(
            TaskRequest::new("failing", TaskType::Generic)
                .with_requirements(["broken"])
                .with_priority(1),
        )
        .unwrap();
    let failing_task = manager.get_plan_status(failing).unwrap().task_id;
    let orphan = manager
        .submit_task(
            TaskRequest::new("orphan", TaskType::Generic)
                .with_requirements(["ok"])
                .with_priority(9)
                .with_dependencies(vec![failing_task]),
        )
        .unwrap();
    assert_eq!(manager.get_system_health().await.queued_tasks, 4);

    manager.process_queue();
    for plan_id in [low, high, failing] {
        manager.await_plan(plan_id, WAIT).await.unwrap();
    }
    let orphan_report = manager.await_plan(orphan, WAIT).await.unwrap();
    assert_eq!(orphan_report.status, PlanStatus::Failed);
    assert_eq!(
        orphan_report.error.as_deref(),
        Some("a task dependency failed")
    );

    let started: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            OrchestrationEvent::ExecutionStarted { plan_id, .. } => Some(plan_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![high, failing, low]);
}

#[tokio::test]
async fn test_background_loop_counts_events() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Retry),
        vec![AgentProfile::new("reporter", "Reporter").with_skills(["reporting"])],
        simulated(&["reporting"], &[], Duration::ZERO),
    );
    let background = manager.start();

    let plan_id = manager
        .submit_task(urgent("Weekly report", &["reporting"]))
        .unwrap();
    manager.await_plan(plan_id, WAIT).await.unwrap();

    for _ in 0..100 {
        if manager.get_system_health().await.counters.executions_completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let health = manager.get_system_health().await;
    assert_eq!(health.counters.executions_started, 1);
    assert_eq!(health.counters.executions_completed, 1);
    let metrics = manager.monitor().agent("reporter").await.unwrap();
    assert_eq!(metrics.steps_completed, 1);

    background.abort();
}

#[tokio::test]
async fn test_busy_agent_is_waited_for_instead_of_failing() {
    let manager = manager_with(
        EngineConfig {
            max_concurrent_agents: 2,
            ..fast_engine(RecoveryMode::Retry)
        },
        vec![AgentProfile::new("reporter", "Reporter").with_skills(["reporting"])],
        simulated(&["reporting"], &[], Duration::from_millis(30)),
    );
    let mut rx = manager.subscribe();

    let first = manager.submit_task(urgent("First", &["reporting"])).unwrap();
    let second = manager.submit_task(urgent("Second", &["reporting"])).unwrap();
    assert_eq!(manager.engine().active_count(), 2);

    for plan_id in [first, second] {
        let report = manager.await_plan(plan_id, WAIT).await.unwrap();
        assert_eq!(report.status, PlanStatus::Completed, "{:?}", report.error);
        let plan = manager.engine().board().get(plan_id).unwrap();
        assert_eq!(plan.steps[0].attempts, 1);
        assert_eq!(plan.recovery_attempts, 0);
    }

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(
        e,
        OrchestrationEvent::StepFailed { .. } | OrchestrationEvent::RecoveryTriggered { .. }
    )));
    assert_eq!(manager.registry().load("reporter"), Some(0));
}

#[tokio::test]
async fn test_redistribute_without_alternative_fails_terminally() {
    let manager = manager_with(
        fast_engine(RecoveryMode::Redistribute),
        vec![AgentProfile::new("worker", "Worker").with_skills(["x"])],
        Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        }),
    );

    let plan_id = manager.submit_task(urgent("Alone", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.plan_id, plan_id);
    let error = report.error.unwrap();
    assert!(error.contains("attempt 3 failed"), "{error}");
    assert!(error.contains("no alternative agent for step 1"), "{error}");
    let plan = manager.engine().board().get(plan_id).unwrap();
    assert_eq!(plan.steps[0].agent_id, "worker");
    assert_eq!(plan.recovery_attempts, 1);
}

/// Fails and walks away: unregisters the agent it was dispatched to.
#[derive(Default)]
struct Deserter {
    registry: Mutex<Option<Arc<CapabilityRegistry>>>,
}

#[async_trait]
impl SkillDispatcher for Deserter {
    async fn dispatch(&self, invocation: &StepInvocation) -> ConductorResult<Payload> {
        if let Some(registry) = self.registry.lock().as_ref() {
            registry.unregister(&invocation.agent_id)?;
        }
        Err(ConductorError::Dispatch(format!("{} left", invocation.agent_id)))
    }
}

#[tokio::test]
async fn test_failover_without_available_agent_fails_terminally() {
    let dispatcher = Arc::new(Deserter::default());
    let manager = manager_with(
        fast_engine(RecoveryMode::Failover),
        vec![AgentProfile::new("worker", "Worker").with_skills(["x"])],
        dispatcher.clone(),
    );
    *dispatcher.registry.lock() = Some(Arc::clone(manager.registry()));
    let mut rx = manager.subscribe();

    let plan_id = manager.submit_task(urgent("Nobody home", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.plan_id, plan_id);
    assert!(report.superseded_by.is_none());
    let error = report.error.unwrap();
    assert!(error.contains("no available agent for step 1"), "{error}");

    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::FailoverTriggered { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestrationEvent::ExecutionFailed { plan_id: p, .. } if *p == plan_id
    )));
}

#[tokio::test]
async fn test_recovery_ceiling_carries_across_failover_clones() {
    let dispatcher = Arc::new(Flaky {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let manager = manager_with(
        EngineConfig {
            max_recovery_attempts: 2,
            ..fast_engine(RecoveryMode::Failover)
        },
        vec![AgentProfile::new("worker", "Worker").with_skills(["x"])],
        dispatcher.clone(),
    );
    let mut rx = manager.subscribe();

    let plan_id = manager.submit_task(urgent("Doomed twice", &["x"])).unwrap();
    let report = manager.await_plan(plan_id, WAIT).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_ne!(report.plan_id, plan_id);
    assert!(report.superseded_by.is_none());
    // Three attempts on the original and on each of its two clones.
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 9);

    let last = manager.engine().board().get(report.plan_id).unwrap();
    assert_eq!(last.recovery_attempts, 2);

    let events = drain(&mut rx);
    let count = |f: fn(&OrchestrationEvent) -> bool| events.iter().filter(|e| f(e)).count();
    assert_eq!(
        count(|e| matches!(e, OrchestrationEvent::RecoveryTriggered { .. })),
        2
    );
    assert_eq!(
        count(|e| matches!(e, OrchestrationEvent::FailoverTriggered { .. })),
        2
    );
    assert_eq!(
        count(|e| matches!(e, OrchestrationEvent::ExecutionFailed { .. })),
        1
    );
}
