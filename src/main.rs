use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use rand::Rng;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use warden::audit::{FanoutSink, MemorySink, SharedSink, TracingSink};
use warden::session::{
    DisplayGeometry, EnvironmentSnapshot, MemorySessionStore, StaticEnvironment,
};
use warden::{CallerId, GuardedCallDispatcher, SessionIntegrityMonitor, SystemClock, WardenConfig};

/// warden - traffic governance and session integrity
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a configuration, then print the effective settings
    ValidateConfig {
        /// YAML configuration file; WARDEN__* environment variables apply on top
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Drive a dispatcher against a synthetic flaky downstream
    Simulate {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of concurrent callers
        #[arg(long, default_value_t = 4)]
        callers: usize,

        /// Requests issued by each caller
        #[arg(long, default_value_t = 150)]
        requests: usize,

        /// Probability that a downstream call fails
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,

        /// Simulated downstream latency in milliseconds
        #[arg(long, default_value_t = 2)]
        latency_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);

    match args.command {
        Command::ValidateConfig { config } => validate_config(config),
        Command::Simulate {
            config,
            callers,
            requests,
            failure_rate,
            latency_ms,
        } => {
            ensure!(
                (0.0..=1.0).contains(&failure_rate),
                "failure rate must be between 0 and 1"
            );
            let config = WardenConfig::load(config.as_deref()).context("loading configuration")?;
            tokio::select! {
                result = simulate(config, callers, requests, failure_rate, Duration::from_millis(latency_ms)) => result,
                _ = shutdown_signal() => {
                    warn!("Simulation interrupted");
                    Ok(())
                }
            }
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn validate_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = WardenConfig::load(path.as_deref()).context("loading configuration")?;
    info!("Configuration is valid");
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn simulate(
    config: WardenConfig,
    callers: usize,
    requests: usize,
    failure_rate: f64,
    latency: Duration,
) -> anyhow::Result<()> {
    info!(callers, requests, failure_rate, "Starting simulation");

    let clock = SystemClock::shared();
    let memory = MemorySink::new();
    let sink: SharedSink = Arc::new(FanoutSink::new(vec![
        Arc::new(memory.clone()) as SharedSink,
        TracingSink::shared(),
    ]));

    let environment = Arc::new(StaticEnvironment::new(EnvironmentSnapshot {
        user_agent: format!("warden-simulator/{}", env!("CARGO_PKG_VERSION")),
        locale: "en-US".to_string(),
        display: DisplayGeometry {
            width: 1920,
            height: 1080,
            color_depth: 24,
        },
        timezone_offset_minutes: 0,
        surface_hash: "simulated".to_string(),
    }));
    let session = Arc::new(SessionIntegrityMonitor::new(
        config.session.clone(),
        environment,
        Arc::new(MemorySessionStore::new()),
        Arc::clone(&clock),
        sink.clone(),
    )?);
    session.sign_in();

    let resources = config.circuit_breaker.resources.clone();
    let dispatcher = Arc::new(
        GuardedCallDispatcher::from_config(config, clock, sink)?.with_session(session),
    );
    let scheduler = Arc::new(dispatcher.scheduler()?);
    let handle = scheduler.spawn();

    let runs = (0..callers).map(|index| {
        let dispatcher = Arc::clone(&dispatcher);
        let resources = resources.clone();
        async move {
            let caller = CallerId::user(format!("sim-{}", index));
            let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
            for request in 0..requests {
                let (fails, operation_key) = {
                    let mut rng = rand::thread_rng();
                    let class = resources
                        .get(rng.gen_range(0..resources.len().max(1)))
                        .map(String::as_str)
                        .unwrap_or("api");
                    (rng.gen_bool(failure_rate), format!("{}:request", class))
                };

                dispatcher.record_activity();
                let result = dispatcher
                    .guard_with_defaults(&caller, &operation_key, || async move {
                        tokio::time::sleep(latency).await;
                        if fails {
                            Err(std::io::Error::other(format!("request {} failed", request)))
                        } else {
                            Ok(())
                        }
                    })
                    .await;

                let outcome = match result {
                    Ok(()) => "ok",
                    Err(err) => err.kind(),
                };
                *outcomes.entry(outcome).or_default() += 1;
            }
            outcomes
        }
    });

    let mut totals: BTreeMap<&'static str, usize> = BTreeMap::new();
    for outcomes in join_all(runs).await {
        for (outcome, count) in outcomes {
            *totals.entry(outcome).or_default() += count;
        }
    }

    handle.shutdown().await;

    println!("outcomes:");
    for (outcome, count) in &totals {
        println!("  {}: {}", outcome, count);
    }

    let mut audit: BTreeMap<&'static str, usize> = BTreeMap::new();
    for event in memory.events() {
        *audit.entry(event.event_kind.as_str()).or_default() += 1;
    }
    println!("audit_events:");
    for (kind, count) in &audit {
        println!("  {}: {}", kind, count);
    }

    println!("breakers:");
    for snapshot in dispatcher.breaker_snapshots() {
        println!(
            "  {}: {} (failures: {})",
            snapshot.resource, snapshot.state, snapshot.failure_count
        );
    }

    info!("Simulation finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
