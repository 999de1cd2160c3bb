use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{
    http_client, report_channel, weight_table, Action, ActionRegistry, Config, CoordinatorSettings,
    EntityScheduler, EventSource, HttpAction, Instance, InstanceCoordinator, InstanceState, MockAction,
    MockEventSource, ReportSummary, ReporterSettings, SchedulerReport, SchedulerSettings,
    SqliteInstanceStore, StatusCode, StatusReporter, TimingAggregator,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Latency of every simulated action in mock mode
const MOCK_LATENCY: Duration = Duration::from_millis(5);
const STATUS_ROUTE: &str = "/api/v4/users/username/{user}/status";

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Chat load test worker - registers an instance and drives simulated users")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Action mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Stop after N milliseconds (overrides config)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Run identifier used in the result file name
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    run_id: String,
    timestamp: String,
    mode: String,
    instance_id: String,
    instance_index: u32,
    seed: u64,
    first_entity: u64,
    entities: u64,
    restarts: u64,
    lost_entities: u64,
    instance_state: String,
    duration_ms: u64,
    status_counts: BTreeMap<StatusCode, u64>,
    recent_errors: Vec<String>,
    score: f64,
    timings: TimingAggregator,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(worker_id) = args.worker_id.clone() {
        config.worker.id = worker_id;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.scenario.duration_ms = Some(duration_ms);
    }

    info!(
        worker_id = %config.worker.id,
        mode = %args.mode,
        entities = config.entities.count,
        "starting worker"
    );

    let registry = build_registry(&config, &args.mode)?;
    info!("Registered {} actions", registry.len());

    let store = SqliteInstanceStore::connect(&config.instance.store_url, 4)
        .await
        .with_context(|| format!("Failed to open instance store {}", config.instance.store_url))?;
    let coordinator = InstanceCoordinator::new(
        Arc::new(store),
        CoordinatorSettings::from_config(&config.instance, config.entities.count),
    );

    let instance = coordinator
        .register()
        .await
        .context("Failed to register instance")?;

    let heartbeat_stop = CancellationToken::new();
    let stop = CancellationToken::new();
    let heartbeat = watch_heartbeat(
        coordinator.spawn_heartbeat(&instance, heartbeat_stop.clone()),
        stop.clone(),
    );

    let run = run_load_test(&config, &args.mode, &registry, &instance, stop).await;

    // Entities are gone; release the index last
    heartbeat_stop.cancel();
    let instance_state = heartbeat.await.unwrap_or(InstanceState::Lost);
    let (scheduled, summary) = run?;

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string());
    let result = WorkerResult {
        worker_id: config.worker.id.clone(),
        run_id,
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode.clone(),
        instance_id: instance.id.clone(),
        instance_index: instance.index,
        seed: instance.seed,
        first_entity: instance.entity_start_num,
        entities: scheduled.entities,
        restarts: scheduled.restarts,
        lost_entities: scheduled.lost,
        instance_state: format!("{instance_state:?}"),
        duration_ms: summary.duration_ms,
        status_counts: summary.status_counts,
        recent_errors: summary.recent_errors,
        score: summary.score,
        timings: summary.timings,
    };

    let output_path = write_result(Path::new(&config.worker.results_dir), &result)?;
    info!("Results written to {}", output_path.display());
    print_summary(&result);

    Ok(())
}

fn build_registry(config: &Config, mode: &str) -> Result<ActionRegistry> {
    match mode {
        "mock" => Ok(ActionRegistry::mock_from_config(&config.actions, MOCK_LATENCY)),
        "http" => ActionRegistry::http_from_config(&config.actions, &config.target)
            .context("Failed to create HTTP actions"),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", mode),
    }
}

fn status_action(config: &Config, mode: &str) -> Result<Arc<dyn Action>> {
    if mode == "http" {
        let client = http_client(&config.target).context("Failed to create HTTP client")?;
        let action = HttpAction::new("status", "GET", STATUS_ROUTE, &config.target.base_url, client)?;
        return Ok(Arc::new(action));
    }
    Ok(Arc::new(MockAction::new("status", STATUS_ROUTE, MOCK_LATENCY)))
}

async fn run_load_test(
    config: &Config,
    mode: &str,
    registry: &ActionRegistry,
    instance: &Instance,
    stop: CancellationToken,
) -> Result<(SchedulerReport, ReportSummary)> {
    let mut scheduler = EntityScheduler::new(
        SchedulerSettings::from(&config.entities),
        registry,
        &weight_table(&config.actions),
    )
    .context("Failed to build entity scheduler")?;

    if let Some(interval_ms) = config.entities.status_poll_interval_ms {
        scheduler = scheduler.with_status_poll(
            status_action(config, mode)?,
            Duration::from_millis(interval_ms),
        );
    }
    if let Some(source) = event_source(
        mode,
        config.entities.listen_events,
        config.entities.action_rate(),
    ) {
        scheduler = scheduler.with_event_source(source);
    }

    let (tx, rx) = report_channel();
    let reporter = StatusReporter::new(ReporterSettings {
        print_every: Duration::from_millis(config.scenario.print_every_ms),
        status_log: config.worker.status_log.as_ref().map(PathBuf::from),
        ..ReporterSettings::default()
    })
    .spawn(rx);

    let scheduler_task = tokio::spawn(scheduler.run(
        instance.entity_start_num,
        instance.seed,
        tx,
        stop.clone(),
    ));

    wait_for_stop(config.scenario.duration_ms, &stop).await;
    info!("Stopping entities...");
    stop.cancel();

    let scheduled = scheduler_task.await.context("entity scheduler panicked")?;
    let summary = reporter.await.context("status reporter panicked")?;
    Ok((scheduled, summary))
}

/// Synthetic events only make sense against the mock target; the HTTP mode
/// has no event stream client.
fn event_source(mode: &str, listen_events: bool, every: Duration) -> Option<Arc<dyn EventSource>> {
    if !listen_events {
        return None;
    }
    if mode != "mock" {
        warn!(mode, "no event source available in this mode, listen_events ignored");
        return None;
    }
    Some(Arc::new(MockEventSource { every, count: 10 }))
}

/// Cancel `stop` when the heartbeat ends with the row gone: another
/// instance may already hold this index and its entity block.
fn watch_heartbeat(
    heartbeat: JoinHandle<InstanceState>,
    stop: CancellationToken,
) -> JoinHandle<InstanceState> {
    tokio::spawn(async move {
        let state = match heartbeat.await {
            Ok(state) => state,
            Err(e) => {
                error!("heartbeat task failed: {e}");
                InstanceState::Lost
            }
        };
        if state == InstanceState::Lost && !stop.is_cancelled() {
            error!("instance registration lost, stopping entities");
            stop.cancel();
        }
        state
    })
}

async fn wait_for_stop(duration_ms: Option<u64>, stop: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let elapsed = async {
        match duration_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = elapsed => info!("Run duration elapsed"),
        _ = ctrl_c => info!("Interrupted"),
        _ = stop.cancelled() => info!("Stop requested"),
    }
}

fn write_result(results_dir: &Path, result: &WorkerResult) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir)
        .with_context(|| format!("Failed to create {}", results_dir.display()))?;
    let output_path = results_dir.join(format!("worker_{}_{}.json", result.worker_id, result.run_id));
    let result_json = serde_json::to_string_pretty(result)?;
    std::fs::write(&output_path, result_json)?;
    Ok(output_path)
}

fn print_summary(result: &WorkerResult) {
    let count = |code: StatusCode| result.status_counts.get(&code).copied().unwrap_or(0);

    println!("\n=== Worker {} Summary ===", result.worker_id);
    println!("Instance: {} (index {})", result.instance_id, result.instance_index);
    println!(
        "Entities: {}..{}",
        result.first_entity,
        result.first_entity + result.entities
    );
    println!("Seed: {}", result.seed);
    println!("Duration: {}ms", result.duration_ms);
    println!("Hits: {}", result.timings.total_hits());
    println!("Errors: {}", result.timings.total_errors());
    println!("Actions sent: {}", count(StatusCode::ActionSent));
    println!("Failed tasks: {}", count(StatusCode::Failed));
    println!("Restarts: {}", result.restarts);
    println!("Instance state: {}", result.instance_state);
    for line in &result.recent_errors {
        println!("  {line}");
    }
    println!("Score: {:.2}", result.score);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_events_only_in_mock_mode() {
        let every = Duration::from_millis(10);
        assert!(event_source("mock", true, every).is_some());
        assert!(event_source("mock", false, every).is_none());
        assert!(event_source("http", true, every).is_none());
    }

    #[tokio::test]
    async fn test_lost_heartbeat_stops_entities() {
        let stop = CancellationToken::new();
        let state = watch_heartbeat(tokio::spawn(async { InstanceState::Lost }), stop.clone())
            .await
            .unwrap();
        assert_eq!(state, InstanceState::Lost);
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_heartbeat_leaves_entities_running() {
        let stop = CancellationToken::new();
        let state = watch_heartbeat(tokio::spawn(async { InstanceState::Closed }), stop.clone())
            .await
            .unwrap();
        assert_eq!(state, InstanceState::Closed);
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_stop_returns_on_cancel() {
        let stop = CancellationToken::new();
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), wait_for_stop(None, &stop))
            .await
            .unwrap();
    }
}
