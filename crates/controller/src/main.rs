use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{Config, StatusCode, TimingAggregator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Chat load rig controller - spawns workers locally and merges route statistics")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Dry run: print what would be executed without running
    #[arg(long)]
    dry_run: bool,

    /// Spawn N local worker processes (overrides config)
    #[arg(long = "local-workers", alias = "local")]
    local_workers: Option<u32>,

    /// Action mode passed to every worker
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Stop every worker after N milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Merge an existing run's worker result JSONs without spawning workers.
    #[arg(long)]
    merge_run_id: Option<String>,
}

/// The subset of a worker result file the merge needs.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    instance_index: u32,
    seed: u64,
    first_entity: u64,
    entities: u64,
    restarts: u64,
    duration_ms: u64,
    #[serde(default)]
    status_counts: BTreeMap<StatusCode, u64>,
    score: f64,
    timings: TimingAggregator,
}

#[derive(Debug, Serialize)]
struct WorkerSummary {
    worker_id: String,
    instance_index: u32,
    seed: u64,
    first_entity: u64,
    entities: u64,
    restarts: u64,
    hits: u64,
    errors: u64,
    score: f64,
}

#[derive(Debug, Serialize)]
struct MergedResult {
    timestamp: String,
    run_id: String,
    worker_count: usize,
    total_duration_ms: u64,
    total_entities: u64,
    total_hits: u64,
    total_errors: u64,
    total_restarts: u64,
    /// Workers that disagreed on the fleet seed
    seed_mismatches: usize,
    status_counts: BTreeMap<StatusCode, u64>,
    score: f64,
    timings: TimingAggregator,
    workers: Vec<WorkerSummary>,
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
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let results_dir = PathBuf::from(&config.worker.results_dir);

    let local_n = args
        .local_workers
        .or_else(|| config.controller.as_ref().and_then(|c| c.local_workers))
        .unwrap_or(0);

    if local_n == 0 {
        if let Some(run_id) = args.merge_run_id.as_deref() {
            let workers = collect_worker_results(&results_dir, run_id)?;
            if workers.is_empty() {
                anyhow::bail!("No worker results found for run_id={run_id}");
            }
            let merged = merge_results(run_id.to_string(), workers);
            save_merged_results(&results_dir, &merged)?;
            print_merged_summary(&merged);
            return Ok(());
        }

        info!("No --local-workers N provided; start workers on each host and merge with --merge-run-id");
        return Ok(());
    }

    let run_id = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let worker_bin = infer_worker_binary().context("Failed to infer worker binary path")?;
    let duration_ms = args.duration_ms.or(config.scenario.duration_ms);

    if args.dry_run {
        print_dry_run(&worker_bin, &args, local_n, &run_id, duration_ms);
        return Ok(());
    }
    if duration_ms.is_none() {
        warn!("No duration configured; workers run until interrupted");
    }

    info!(
        "Spawning {} local workers using {:?} (run_id={}, store={})",
        local_n, worker_bin, run_id, config.instance.store_url
    );

    let mut handles = Vec::new();
    for i in 0..local_n {
        let worker_id = format!("worker-{i}");
        let mut cmd = Command::new(&worker_bin);
        cmd.args(worker_args(&args, &worker_id, &run_id, duration_ms))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker {worker_id}"))?;

        handles.push(tokio::spawn(async move {
            let status = child.wait().await?;
            if !status.success() {
                anyhow::bail!("Worker {worker_id} exited with status {status}");
            }
            Ok::<(), anyhow::Error>(())
        }));
    }

    for h in handles {
        h.await??;
    }

    let workers = collect_worker_results(&results_dir, &run_id)?;
    if workers.is_empty() {
        anyhow::bail!("No worker results found for run_id={run_id}");
    }

    let merged = merge_results(run_id.clone(), workers);
    save_merged_results(&results_dir, &merged)?;
    print_merged_summary(&merged);

    Ok(())
}

fn worker_args(args: &Args, worker_id: &str, run_id: &str, duration_ms: Option<u64>) -> Vec<String> {
    let mut out = vec![
        "--config".to_string(),
        args.config.display().to_string(),
        "--mode".to_string(),
        args.mode.clone(),
        "--worker-id".to_string(),
        worker_id.to_string(),
        "--run-id".to_string(),
        run_id.to_string(),
    ];
    if let Some(ms) = duration_ms {
        out.push("--duration-ms".to_string());
        out.push(ms.to_string());
    }
    out
}

fn print_dry_run(worker_bin: &Path, args: &Args, local_n: u32, run_id: &str, duration_ms: Option<u64>) {
    println!("\n=== Dry Run ===");
    println!("worker_bin: {:?}", worker_bin);
    println!("config: {:?}", args.config);
    println!("local workers: {}", local_n);
    println!("run_id: {}", run_id);
    println!("\nWould execute:");

    for i in 0..local_n {
        let worker_id = format!("worker-{i}");
        println!(
            "  {:?} {}",
            worker_bin,
            worker_args(args, &worker_id, run_id, duration_ms).join(" ")
        );
    }
    println!();
}

fn infer_worker_binary() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("WORKER_BIN") {
        return Ok(PathBuf::from(p));
    }

    let exe = std::env::current_exe()?;
    let exe_dir = exe
        .parent()
        .context("current_exe has no parent directory")?;

    // Built together, the worker sits next to the controller.
    let candidate = exe_dir.join("worker");
    if candidate.exists() {
        return Ok(candidate);
    }

    for p in ["target/release/worker", "target/debug/worker"] {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
    }

    anyhow::bail!("Could not find worker binary. Build it first (cargo build --bin worker).")
}

fn collect_worker_results(results_dir: &Path, run_id: &str) -> Result<Vec<WorkerResult>> {
    let mut results = Vec::new();
    if !results_dir.exists() {
        return Ok(results);
    }

    let suffix = format!("_{run_id}.json");
    for entry in std::fs::read_dir(results_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.starts_with("worker_") || !name.ends_with(&suffix) {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        let result: WorkerResult = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        results.push(result);
    }

    results.sort_by_key(|w| w.instance_index);
    Ok(results)
}

fn merge_results(run_id: String, workers: Vec<WorkerResult>) -> MergedResult {
    let mut timings = workers
        .iter()
        .fold(TimingAggregator::new(), |acc, w| acc.merge(&w.timings));
    timings.calc_results();

    let mut status_counts = BTreeMap::new();
    for w in &workers {
        for (code, n) in &w.status_counts {
            *status_counts.entry(*code).or_insert(0) += n;
        }
    }

    let seed = workers.first().map(|w| w.seed);
    let seed_mismatches = workers.iter().filter(|w| Some(w.seed) != seed).count();
    if seed_mismatches > 0 {
        warn!(seed_mismatches, "workers ran with different fleet seeds");
    }

    let summaries = workers
        .iter()
        .map(|w| WorkerSummary {
            worker_id: w.worker_id.clone(),
            instance_index: w.instance_index,
            seed: w.seed,
            first_entity: w.first_entity,
            entities: w.entities,
            restarts: w.restarts,
            hits: w.timings.total_hits(),
            errors: w.timings.total_errors(),
            score: w.score,
        })
        .collect();

    MergedResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        run_id,
        worker_count: workers.len(),
        total_duration_ms: workers.iter().map(|w| w.duration_ms).max().unwrap_or(0),
        total_entities: workers.iter().map(|w| w.entities).sum(),
        total_hits: timings.total_hits(),
        total_errors: timings.total_errors(),
        total_restarts: workers.iter().map(|w| w.restarts).sum(),
        seed_mismatches,
        status_counts,
        score: timings.score(),
        timings,
        workers: summaries,
    }
}

fn save_merged_results(results_dir: &Path, merged: &MergedResult) -> Result<()> {
    std::fs::create_dir_all(results_dir).ok();
    let output_path = results_dir.join(format!("run_{}_merged.json", merged.run_id));
    let result_json = serde_json::to_string_pretty(merged)?;
    std::fs::write(&output_path, result_json)?;
    info!("Merged results written to {}", output_path.display());
    Ok(())
}

fn print_merged_summary(merged: &MergedResult) {
    println!(
        "\n=== Merged Results ({} workers, run_id={}) ===",
        merged.worker_count, merged.run_id
    );
    println!("Total duration: {}ms", merged.total_duration_ms);
    println!("Total entities: {}", merged.total_entities);
    println!("Total hits: {}", merged.total_hits);
    println!("Total errors: {}", merged.total_errors);
    println!("Total restarts: {}", merged.total_restarts);
    for (code, n) in &merged.status_counts {
        println!("  {code}: {n}");
    }
    println!();
    println!(
        "{:<48} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>7}",
        "route", "hits", "errors", "median", "p90", "p95", "iqr", "err%"
    );
    for (route, stats) in &merged.timings.routes {
        let r = &stats.results;
        println!(
            "{:<48} {:>8} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>6.2}%",
            route,
            stats.hits,
            stats.errors,
            r.median,
            r.p90,
            r.p95,
            r.inter_quartile_range,
            r.error_rate * 100.0
        );
    }
    println!();
    println!("Score: {:.2}", merged.score);
    println!();
}
