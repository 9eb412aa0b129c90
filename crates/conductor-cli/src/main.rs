mod config;
mod simulated;

use clap::{Parser, Subcommand};
use conductor_core::{ConductorError, ConductorResult, EventBus, OrchestrationEvent};
use conductor_orchestrator::{
    AgentRouter, ExecutionPlan, ExecutionTask, HeuristicOracle, ParallelExecutor, PlanRequest,
    PlanResult, Planner, RoutingContext, RoutingDecision, RoutingTask, Subtask, SubtaskResult,
    WorkerPool,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: plan, route and run multi-agent task graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Concurrent tasks per phase (overrides config)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Replan failed subtasks automatically (overrides config)
    #[arg(long)]
    auto_replan: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a goal and print the task graph
    Plan {
        goal: String,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Plan a goal and run it layer by layer, routing each subtask
    Run { goal: String },
    /// Plan a goal, route every task up front and run it through the parallel executor
    Dispatch { goal: String },
    /// List configured workers
    Workers,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(max) = cli.max_concurrent {
        config.executor.max_concurrent = max;
    }
    if cli.auto_replan {
        config.planner.auto_replan = true;
    }

    let workers = config.workers();
    let pool = simulated::build_pool(&workers);
    let events = EventBus::default();
    spawn_event_logger(&events);

    let planner = Planner::new(Arc::new(HeuristicOracle::new()), config.planner.clone())
        .with_events(events.clone());
    let router = AgentRouter::new(config.router.clone());

    match cli.command {
        Commands::Plan { goal, json } => {
            let result = planner.plan(PlanRequest::new(goal)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_plan(&result);
            }
            if !result.success {
                anyhow::bail!("planning failed");
            }
        }
        Commands::Run { goal } => {
            let result = planner.plan(PlanRequest::new(goal)).await;
            print_plan(&result);
            let plan_id = planned(&result)?;

            let (router, pool) = (&router, &pool);
            let outcome = planner
                .execute_plan(plan_id, move |subtask| run_direct(router, pool, subtask))
                .await?;

            println!("\n{}", outcome.summary);
            if let Some(graph) = planner.get_plan(plan_id) {
                println!("\n{}", graph.visualize());
            }
            println!("Routing decisions logged: {}", router.log().len());
            if !outcome.success {
                anyhow::bail!("plan did not complete");
            }
        }
        Commands::Dispatch { goal } => {
            let result = planner.plan(PlanRequest::new(goal)).await;
            print_plan(&result);
            planned(&result)?;
            let Some(graph) = result.graph.as_ref() else {
                anyhow::bail!("planning produced no graph");
            };

            let plan = ExecutionPlan::from_graph(graph);
            let tasks: Vec<RoutingTask> = plan.tasks().map(RoutingTask::from).collect();
            let routing: HashMap<_, RoutingDecision> = router
                .route_batch(&tasks, &pool.snapshot(), &RoutingContext::new())
                .into_iter()
                .map(|d| (d.task_id, d))
                .collect();
            for decision in routing.values() {
                println!(
                    "  route {} -> {} ({:.2})",
                    decision.task_id, decision.worker_id, decision.confidence
                );
            }

            let executor = ParallelExecutor::new(config.executor.clone()).with_events(events);
            let report = executor.execute(plan, &routing, &pool).await;

            println!("\n{}", report.summary);
            for task in report.plan.tasks() {
                println!(
                    "  [{:?}] {} (worker: {}, retries: {})",
                    task.status,
                    task.description,
                    task.assigned_worker.as_deref().unwrap_or("-"),
                    task.retry_count
                );
            }
            if report.failed > 0 {
                anyhow::bail!("{} task(s) failed", report.failed);
            }
        }
        Commands::Workers => {
            println!("Configured workers:");
            for profile in pool.snapshot() {
                println!("  {} ({}) [{}]", profile.id, profile.name, profile.category);
                if !profile.capabilities.is_empty() {
                    println!("    Capabilities: {}", profile.capabilities.join(", "));
                }
                println!("    Max concurrent: {}", profile.max_concurrent);
            }
            println!("\nTotal: {} worker(s)", pool.len());
        }
    }

    Ok(())
}

fn planned(result: &PlanResult) -> anyhow::Result<uuid::Uuid> {
    match result.plan_id {
        Some(id) if result.success => Ok(id),
        _ => anyhow::bail!(
            "planning failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn print_plan(result: &PlanResult) {
    if !result.success {
        println!(
            "Planning failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    } else {
        println!("{}", result.visualization);
        if !result.reasoning.is_empty() {
            println!("Reasoning: {}", result.reasoning);
        }
        println!("Estimated duration: {}ms", result.estimated_duration_ms);
    }
    for warning in &result.warnings {
        println!("Warning: {warning}");
    }
}

/// Route one subtask and run it on the chosen worker. The result names the
/// worker so a reassignment can steer away from it.
async fn run_direct(
    router: &AgentRouter,
    pool: &WorkerPool,
    subtask: Subtask,
) -> ConductorResult<SubtaskResult> {
    let context = subtask
        .excluded_workers()
        .into_iter()
        .fold(RoutingContext::new(), RoutingContext::exclude);
    let decision = router.route(&RoutingTask::from(&subtask), &pool.snapshot(), &context)?;
    let worker = pool.worker(&decision.worker_id).ok_or_else(|| {
        ConductorError::Worker(format!("Worker '{}' is not registered", decision.worker_id))
    })?;

    let mut task = ExecutionTask::from_subtask(&subtask);
    task.assigned_worker = Some(decision.worker_id.clone());

    pool.start_task(&decision.worker_id)?;
    let started = Instant::now();
    let outcome = worker.execute(&task).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    pool.finish_task(
        &decision.worker_id,
        outcome.as_ref().is_ok_and(|o| o.success),
        latency_ms,
    );

    let result = match outcome {
        Ok(output) if output.success => SubtaskResult::success(output.output, output.message),
        Ok(output) => SubtaskResult::failure(output.error.unwrap_or(output.message)),
        Err(e) => SubtaskResult::failure(e.to_string()),
    };
    Ok(result
        .with_duration(latency_ms)
        .with_worker(decision.worker_id))
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                OrchestrationEvent::PlanFinished { plan_id, success, duration_ms, .. } => {
                    info!(plan_id = %plan_id, success, duration_ms, "Plan finished");
                }
                other => debug!(event = ?other, "Orchestration event"),
            }
        }
    });
}
