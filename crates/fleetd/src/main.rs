//! fleetd: the FleetGrid daemon.
//!
//! Single binary that assembles the FleetGrid subsystems:
//! - State store (redb)
//! - Action and rollout managers
//! - Rollout scheduler loop
//! - Auto-assignment loop
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetd.toml --data-dir /var/lib/fleetgrid
//! fleetd check-filter 'updateStatus==ERROR;attribute.region==eu*'
//! fleetd init-config > fleetd.toml
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use fleet_core::{FleetConfig, LoggingConfig};
use fleetgrid_filter::Schema;
use fleetgrid_rollout::{ActionManager, EventBus, RolloutManager};
use fleetgrid_scheduler::{AutoAssigner, RolloutScheduler};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and auto-assignment loops until Ctrl-C.
    Run {
        /// Path to fleetd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },

    /// Parse a filter expression and print its canonical form.
    CheckFilter {
        expression: String,

        #[arg(long, value_enum, default_value = "target")]
        schema: SchemaArg,
    },

    /// Print the default configuration as TOML.
    InitConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaArg {
    Target,
    FilterQuery,
    Rollout,
}

impl From<SchemaArg> for Schema {
    fn from(arg: SchemaArg) -> Self {
        match arg {
            SchemaArg::Target => Schema::Target,
            SchemaArg::FilterQuery => Schema::FilterQuery,
            SchemaArg::Rollout => Schema::Rollout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging)?;
            run(config, data_dir).await
        }
        Command::CheckFilter { expression, schema } => {
            println!("{}", check_filter(&expression, schema.into())?);
            Ok(())
        }
        Command::InitConfig => {
            print!("{}", FleetConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

/// `RUST_LOG` wins, then the configured directive, then the built-in default.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn check_filter(expression: &str, schema: Schema) -> anyhow::Result<String> {
    let predicate = fleetgrid_filter::parse(expression, schema)
        .map_err(|e| anyhow::anyhow!("invalid filter: {e}"))?;
    Ok(predicate.to_string())
}

async fn run(config: FleetConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    let tick_interval = config.scheduler.tick_interval()?;
    let auto_assign_interval = config.scheduler.auto_assign_interval()?;
    let action_timeout = config.scheduler.action_timeout()?;

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&data_dir)?;
    let db_path = config.store_path(&data_dir);
    let store = fleetgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let events = EventBus::default();
    let actions = ActionManager::new(store.clone(), events.clone(), action_timeout);
    let rollouts = RolloutManager::new(
        store.clone(),
        actions.clone(),
        events.clone(),
        config.rollout.clone(),
    );

    let scheduler = RolloutScheduler::new(rollouts, config.scheduler.max_parallel_rollouts);
    info!(
        interval_ms = tick_interval.as_millis() as u64,
        max_parallel = config.scheduler.max_parallel_rollouts,
        "rollout scheduler initialized"
    );

    let assigner = AutoAssigner::new(store, actions, config.scheduler.page_size);
    info!(
        interval_ms = auto_assign_interval.as_millis() as u64,
        "auto-assigner initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(tick_interval, scheduler_shutdown).await;
    });

    let assign_shutdown = shutdown_rx.clone();
    let assign_handle = tokio::spawn(async move {
        assigner.run(auto_assign_interval, assign_shutdown).await;
    });

    let event_handle = tokio::spawn(log_events(events.subscribe(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = assign_handle.await;
    let _ = event_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}

/// Mirror every published event into the log as a JSON line.
async fn log_events(
    mut events: broadcast::Receiver<fleetgrid_rollout::FleetEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => debug!(event = %line, "fleet event"),
                    Err(e) => warn!(error = %e, "failed to encode fleet event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log lagging behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
