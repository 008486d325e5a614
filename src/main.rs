use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{interval, Duration};
use tracing_subscriber::EnvFilter;

use tradeguard::api::{BybitClient, BYBIT_API_BASE, BYBIT_TESTNET_API_BASE};
use tradeguard::breaker::{BreakerStatus, CircuitBreaker, RequestGate};
use tradeguard::emergency::{EmergencyStatusReport, EmergencyStopManager};
use tradeguard::{BreakerConfig, CircuitOpenError};

#[derive(Debug, Parser)]
#[command(name = "tradeguard", about = "Circuit breaker for exchange API traffic")]
struct Cli {
    /// Configuration file (defaults to ./tradeguard.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,
    /// Drive a simulated flaky API through the breaker
    Simulate(SimulateArgs),
    /// Poll the exchange server time through the breaker until Ctrl+C
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Calls issued by each worker
    #[arg(long, default_value_t = 50)]
    calls: usize,
    /// Concurrent workers sharing the breaker
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Probability that a simulated call fails
    #[arg(long, default_value_t = 0.3)]
    failure_rate: f64,
    /// Pause between calls of one worker
    #[arg(long, default_value_t = 50)]
    pause_ms: u64,
    /// Override the recovery timeout so trial mode is reachable in a short run
    #[arg(long)]
    recovery_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct ProbeArgs {
    /// Exchange REST endpoint (defaults to Bybit mainnet)
    #[arg(long, conflicts_with = "testnet")]
    base_url: Option<String>,
    /// Probe the Bybit testnet instead of mainnet
    #[arg(long)]
    testnet: bool,
    #[arg(long, default_value_t = 5)]
    every_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BreakerConfig::load_from(path),
        None => BreakerConfig::load(),
    }
    .context("Failed to load breaker configuration")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate(args) => run_simulation(config, args).await,
        Command::Probe(args) => run_probe(config, args).await,
    }
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tradeguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug, Error)]
enum SimulatedError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("bad gateway (HTTP 502)")]
    BadGateway,
    #[error(transparent)]
    Rejected(#[from] CircuitOpenError),
}

impl SimulatedError {
    fn kind(&self) -> String {
        match self {
            SimulatedError::RateLimited => "HTTP_429".to_string(),
            SimulatedError::BadGateway => "HTTP_502".to_string(),
            SimulatedError::Rejected(_) => "CIRCUIT_OPEN".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct WorkerTally {
    succeeded: usize,
    failed: usize,
    rejected: usize,
}

impl WorkerTally {
    fn merge(&mut self, other: WorkerTally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    calls: WorkerTally,
    breaker: BreakerStatus,
    healthy: bool,
    health: String,
    emergency: EmergencyStatusReport,
}

async fn simulated_api_call(failure_rate: f64) -> Result<u64, SimulatedError> {
    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 5 + 1)).await;

    let roll: f64 = rand::random();
    if roll < failure_rate / 2.0 {
        Err(SimulatedError::RateLimited)
    } else if roll < failure_rate {
        Err(SimulatedError::BadGateway)
    } else {
        Ok(rand::random::<u64>() % 100_000)
    }
}

async fn simulation_worker(
    id: usize,
    gate: RequestGate,
    calls: usize,
    failure_rate: f64,
    pause: Duration,
) -> WorkerTally {
    let mut tally = WorkerTally::default();

    for _ in 0..calls {
        let result = gate
            .call_classified(|| simulated_api_call(failure_rate), SimulatedError::kind)
            .await;

        match result {
            Ok(_) => tally.succeeded += 1,
            Err(SimulatedError::Rejected(e)) => {
                tracing::debug!(worker = id, "Call rejected: {}", e.reason);
                tally.rejected += 1;
            }
            Err(e) => {
                tracing::debug!(worker = id, "Call failed: {}", e);
                tally.failed += 1;
            }
        }

        tokio::time::sleep(pause).await;
    }

    tally
}

async fn run_simulation(mut config: BreakerConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if let Some(secs) = args.recovery_secs {
        config.recovery_timeout_secs = secs;
    }

    tracing::info!(
        "🧪 Simulating {} workers x {} calls (failure rate {:.0}%)",
        args.workers,
        args.calls,
        args.failure_rate * 100.0
    );

    let emergency = Arc::new(EmergencyStopManager::default());
    let breaker = Arc::new(CircuitBreaker::new(config, emergency.clone())?);
    breaker.start_monitoring();
    let gate = RequestGate::new(breaker.clone());

    let pause = Duration::from_millis(args.pause_ms);
    let workers: Vec<_> = (0..args.workers)
        .map(|id| {
            let gate = gate.clone();
            tokio::spawn(simulation_worker(
                id,
                gate,
                args.calls,
                args.failure_rate,
                pause,
            ))
        })
        .collect();

    let mut totals = WorkerTally::default();
    for worker in workers {
        totals.merge(worker.await?);
    }

    breaker.stop_monitoring().await?;
    // Refresh rates once more so the report reflects the whole run
    breaker.monitor_tick();

    let (healthy, health) = breaker.get_health_check();
    let report = SimulationReport {
        calls: totals,
        breaker: breaker.get_status(),
        healthy,
        health,
        emergency: emergency.status_report(),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Live probe
// ============================================================================

async fn run_probe(config: BreakerConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let emergency = Arc::new(EmergencyStopManager::default());
    let breaker = Arc::new(CircuitBreaker::new(config, emergency.clone())?);
    breaker.start_monitoring();

    let base_url = match (args.base_url, args.testnet) {
        (Some(url), _) => url,
        (None, true) => BYBIT_TESTNET_API_BASE.to_string(),
        (None, false) => BYBIT_API_BASE.to_string(),
    };
    let client = BybitClient::new(base_url.as_str(), RequestGate::new(breaker.clone()))?;

    tracing::info!("📡 Probing {} every {}s", base_url, args.every_secs);
    tracing::info!("Press Ctrl+C to stop...");

    let mut ticker = interval(Duration::from_secs(args.every_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match client.get_server_time().await {
                    Ok(time) => tracing::info!("✓ Server time {}", time),
                    Err(e) => tracing::warn!("✗ Probe failed ({}): {}", e.kind(), e),
                }

                let (healthy, description) = breaker.get_health_check();
                let status = breaker.get_status();
                tracing::info!(
                    state = %status.state,
                    total_errors = status.total_errors,
                    healthy,
                    "{}",
                    description
                );

                if emergency.check_conditions() {
                    let (_, reason) = emergency.is_trading_allowed();
                    tracing::error!("🚨 {}", reason);
                }
            }
        }
    }

    breaker.stop_monitoring().await?;
    println!("{}", serde_json::to_string_pretty(&breaker.get_status())?);
    Ok(())
}
