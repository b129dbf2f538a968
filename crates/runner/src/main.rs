use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stress_core::{
    ChaincodeClient, Config, CostSummary, EventSource, JobRunner, JsonRpcClient, MockClient,
    MockLedger, RunSummary, RunnerSignal, TcpEventSource, Workload,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stress-runner")]
#[command(about = "Chaincode stress runner - submits jobs and tracks them until confirmed")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Submission mode: mock or rpc
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Runner name (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// Number of jobs to submit (overrides config)
    #[arg(long)]
    count: Option<u64>,

    /// Simulated call latency in mock mode
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,
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
    if let Some(name) = args.name {
        config.runner.name = name;
    }
    if let Some(count) = args.count {
        config.workload.count = count;
    }

    info!(
        "Starting runner '{}' in {} mode",
        config.runner.name, args.mode
    );
    info!(
        "Target: {} chaincode={} invoke={}",
        config.workload.target.url,
        config.workload.target.chaincode_id,
        config.workload.target.is_invoke
    );

    let (client, events): (Arc<dyn ChaincodeClient>, Arc<dyn EventSource>) =
        match args.mode.as_str() {
            "mock" => {
                let (ledger, source) = MockLedger::new(args.mock_delay_ms.saturating_mul(4));
                let client: Arc<dyn ChaincodeClient> =
                    Arc::new(MockClient::new(args.mock_delay_ms).with_ledger(ledger));
                let events: Arc<dyn EventSource> = Arc::new(source);
                (client, events)
            }
            "rpc" => {
                let client: Arc<dyn ChaincodeClient> = Arc::new(
                    JsonRpcClient::new(config.runner.request_timeout_ms)
                        .context("Failed to create JSON-RPC client")?,
                );
                let events: Arc<dyn EventSource> =
                    Arc::new(TcpEventSource::new(config.events.addr.clone()));
                (client, events)
            }
            _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'rpc'", args.mode),
        };

    info!("Using client: {}", client.name());

    let runner = Arc::new(JobRunner::new(config.runner.clone(), client, events));
    let (jobs, feeder) = Workload::new(config.workload.clone()).spawn_feeder(100);

    {
        let runner = runner.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping runner...");
                runner.stop();
            }
        });
    }

    runner
        .execute(jobs)
        .await
        .context("Runner failed to start")?;
    feeder.abort();

    match runner.next_signal().await {
        Some(RunnerSignal::Idle) => info!("Event stream idle, collecting results"),
        Some(RunnerSignal::Disconnected(reason)) => {
            warn!("Block listener disconnected ({}), collecting partial results", reason)
        }
        None => warn!("Block listener exited, collecting partial results"),
    }

    let summary = runner.collect_stats(config.report.failed_sample_size);
    runner.shutdown().await;

    let output_path = write_summary(&config.report.results_dir, &summary)?;
    info!("Results written to {}", output_path.display());
    print_summary(&summary);

    Ok(())
}

fn write_summary(results_dir: &str, summary: &RunSummary) -> Result<PathBuf> {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let dir = Path::new(results_dir);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results dir {:?}", dir))?;

    let output_path = dir.join(format!("run_{}_{}.json", summary.name, timestamp));
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&output_path, json)
        .with_context(|| format!("Failed to write {:?}", output_path))?;
    Ok(output_path)
}

fn fmt_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{:.3}s", ms / 1000.0),
        None => "n/a".to_string(),
    }
}

fn print_costs(label: &str, costs: &CostSummary) {
    println!("Min {} cost: {}", label, fmt_ms(costs.min_ms));
    println!("Max {} cost: {}", label, fmt_ms(costs.max_ms));
    println!("Avg {} cost: {}", label, fmt_ms(costs.avg_ms));
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Runner {} Summary ===", summary.name);
    println!("Total time: {}", fmt_ms(summary.total_time_ms));
    println!("Total jobs: {}", summary.job_count);
    println!("Finished: {}", summary.finished_count);
    println!("Successful: {}", summary.success_count);
    println!(
        "Failed: {} (rejected {}, unconfirmed {}, transport {})",
        summary.failed_count,
        summary.rejected_count,
        summary.unconfirmed_count,
        summary.transport_error_count
    );
    match summary.jobs_per_sec {
        Some(tps) => println!("Submitted TPS: {:.1}", tps),
        None => println!("Submitted TPS: n/a"),
    }
    print_costs("execution", &summary.execution);
    print_costs("confirm", &summary.confirmation);

    if !summary.failed_samples.is_empty() {
        println!("\nFailed job samples:");
        for failed in &summary.failed_samples {
            println!(
                "  {} txid={} kind={:?} error={:?}",
                failed.name, failed.tx_id, failed.kind, failed.error
            );
        }
    }
    println!();
}
