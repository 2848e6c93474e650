use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    HandlerRegistry, OrchestrationManager, OrchestratorConfig, SimulatedSkill, TaskRequest,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: capability-based task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the configured tasks and wait for every plan to finish
    Run {
        /// Per-plan wait limit in seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Parse and validate the config file
    Validate,
    /// Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List configured agents in ranking order
    List,
}

#[derive(Deserialize)]
struct ConductorFile {
    #[serde(flatten)]
    orchestrator: OrchestratorConfig,
    #[serde(default)]
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    simulation: SimulationConfig,
}

#[derive(Deserialize)]
struct TaskSpec {
    #[serde(flatten)]
    request: TaskRequest,
    /// Indices of earlier `[[tasks]]` entries this task waits for.
    #[serde(default)]
    after: Vec<usize>,
}

#[derive(Deserialize)]
struct SimulationConfig {
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
    #[serde(default)]
    failing_agents: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            failing_agents: Vec::new(),
        }
    }
}

fn default_delay_ms() -> u64 {
    100
}

impl ConductorFile {
    fn parse(source: &str) -> anyhow::Result<Self> {
        let file: Self = toml::from_str(source)?;
        file.validate()?;
        Ok(file)
    }

    async fn load(path: &Path) -> anyhow::Result<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&source)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;
        for (index, task) in self.tasks.iter().enumerate() {
            if let Some(bad) = task.after.iter().find(|dep| **dep >= index) {
                anyhow::bail!("task {index} may only wait for earlier tasks, not task {bad}");
            }
        }
        Ok(())
    }

    /// One simulated handler for every skill and capability an agent advertises.
    fn handlers(&self) -> HandlerRegistry {
        let names: BTreeSet<&str> = self
            .orchestrator
            .agents
            .iter()
            .flat_map(|a| a.skills.iter().chain(a.capabilities.iter()))
            .map(String::as_str)
            .collect();
        let delay = Duration::from_millis(self.simulation.delay_ms);
        let mut handlers = HandlerRegistry::new();
        for name in names {
            let skill = SimulatedSkill::new(name, delay)
                .failing_for(self.simulation.failing_agents.iter().cloned());
            handlers.register(Arc::new(skill));
        }
        handlers
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let file = ConductorFile::load(&cli.config).await?;

    match cli.command {
        Commands::Validate => {
            println!(
                "{}: {} agents, {} tasks, recovery mode {}",
                cli.config.display(),
                file.orchestrator.agents.len(),
                file.tasks.len(),
                file.orchestrator.engine.recovery_mode
            );
        }
        Commands::Agents {
            action: AgentAction::List,
        } => {
            let manager =
                OrchestrationManager::new(file.orchestrator.clone(), Arc::new(file.handlers()))?;
            for agent in manager.registry().agents() {
                let skills: Vec<&str> = agent.skills.iter().map(String::as_str).collect();
                println!(
                    "{:<16} priority {:>3}  confidence {:.2}  {:<8}  skills: {}",
                    agent.id,
                    agent.priority,
                    agent.confidence,
                    agent.health(),
                    skills.join(", ")
                );
            }
        }
        Commands::Run { timeout_secs } => run(file, Duration::from_secs(timeout_secs)).await?,
    }

    Ok(())
}

async fn run(file: ConductorFile, timeout: Duration) -> anyhow::Result<()> {
    let handlers = file.handlers();
    info!(skills = handlers.handler_count(), "Simulated skills registered");
    let manager = OrchestrationManager::new(file.orchestrator, Arc::new(handlers))?;
    let background = manager.start();

    let mut plans = Vec::with_capacity(file.tasks.len());
    let mut task_ids = Vec::with_capacity(file.tasks.len());
    for spec in file.tasks {
        let mut request = spec.request;
        request.dependencies = spec
            .after
            .iter()
            .filter_map(|i| task_ids.get(*i).copied())
            .collect();
        let description = request.description.clone();
        let plan_id = manager.submit_task(request)?;
        let task_id = manager.get_plan_status(plan_id)?.task_id;
        info!(plan_id = %plan_id, task = %description, "Task submitted");
        task_ids.push(task_id);
        plans.push(plan_id);
    }
    manager.process_queue();

    let mut failed = 0usize;
    for plan_id in plans {
        match manager.await_plan(plan_id, timeout).await {
            Ok(report) => {
                if report.error.is_some() {
                    failed += 1;
                }
                println!("{}", serde_json::to_string(&report)?);
            }
            Err(e) => {
                failed += 1;
                warn!(plan_id = %plan_id, error = %e, "Plan did not finish");
            }
        }
    }

    let health = manager.get_system_health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    background.abort();

    if failed > 0 {
        anyhow::bail!("{failed} plan(s) failed");
    }
    Ok(())
}
