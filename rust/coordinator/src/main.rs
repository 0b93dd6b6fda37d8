//! Federated Learning Round Coordinator
//!
//! Runs the round coordinator against an in-process federation of simulated
//! nodes and logs each committed model.
//!
//! # Usage
//!
//! ```bash
//! # Five rounds with default policy
//! fl-coordinator
//!
//! # Twenty rounds with a configuration file and deterministic randomness
//! fl-coordinator --config federation.toml --rounds 20 --seed 42
//! ```

mod simulation;

use clap::Parser;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use federation_core::{FederationConfig, FederationError, RoundOutcome};
use simulation::Simulation;

/// Federated Learning Round Coordinator
#[derive(Parser, Debug)]
#[command(name = "fl-coordinator")]
#[command(about = "Coordinates privacy-preserving federated learning rounds")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Number of rounds to run
    #[arg(short, long, default_value = "5")]
    rounds: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed for simulated updates and, unless configured, server noise
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => FederationConfig::from_file(path)?,
        None => FederationConfig::default(),
    }
    .with_env_overrides();
    if let Some(seed) = args.seed {
        config.privacy.noise_seed.get_or_insert(seed);
    }
    config.validate()?;

    tracing::info!("Starting FL Coordinator");
    tracing::info!("  Rounds: {}", args.rounds);
    tracing::info!("  Quorum: {}", config.policy.quorum_min);
    tracing::info!("  Round deadline: {}ms", config.policy.round_deadline_ms);
    tracing::info!(
        "  Privacy: {} (epsilon={}, delta={})",
        config.privacy.mechanism,
        config.privacy.epsilon_per_round,
        config.privacy.delta_per_round
    );

    let mut simulation = Simulation::new(config, args.seed)?;
    let coordinator = simulation.coordinator().clone();

    // Background tasks
    let monitor = coordinator.spawn_liveness_monitor();
    let mut feed = coordinator.subscribe();
    let dashboard = tokio::spawn(async move {
        while let Some(model) = feed.next().await {
            tracing::info!(
                version = model.version,
                participants = model.metrics.participants,
                epsilon = model.metrics.epsilon,
                noise_scale = model.metrics.noise_scale,
                update_norm = model.metrics.update_norm,
                "Dashboard received model"
            );
        }
    });

    let rounds = args.rounds;
    let run = async {
        for _ in 0..rounds {
            let report = simulation.run_round().await?;
            match &report.outcome {
                RoundOutcome::Committed { version } => tracing::info!(
                    "Round {}: committed version {}, participants={}, compliance_rate={:.2}",
                    report.round_id,
                    version,
                    report.participants,
                    report.compliance_rate
                ),
                RoundOutcome::Aborted(reason) => tracing::warn!(
                    "Round {}: aborted ({}), compliance_rate={:.2}",
                    report.round_id,
                    reason,
                    report.compliance_rate
                ),
            }
        }
        Ok::<_, FederationError>(())
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down coordinator...");
        }
    }

    monitor.abort();
    dashboard.abort();

    let spent = coordinator.ledger().spent_global();
    tracing::info!(
        "Final model version {}; global spend epsilon={:.3}, delta={:.2e}",
        coordinator.current_model().version,
        spent.epsilon,
        spent.delta
    );

    Ok(())
}
