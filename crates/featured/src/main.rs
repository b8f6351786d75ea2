//! featured — the featuregrid daemon.
//!
//! Runs the feature host for one class of binary:
//! - Feature gate built from the config file and `--feature-gates`
//! - State store (redb) holding the published Feature records
//! - Rollout host: leader election, version latching, provider hooks
//!
//! # Usage
//!
//! ```text
//! featured run --config /etc/featured.toml --feature-gates Foo=true
//! featured gates --config /etc/featured.toml
//! featured status --config /etc/featured.toml
//! featured set-desired --config /etc/featured.toml --feature Foo --desired enabled
//! ```

mod config;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use featuregrid_state::{Enablement, FeatureStore};
use tokio::sync::watch;
use tracing::info;

use crate::config::DaemonConfig;
use crate::daemon::Overrides;

#[derive(Parser)]
#[command(name = "featured", about = "featuregrid feature host daemon")]
struct Cli {
    /// Path to featured.toml.
    #[arg(long, global = true, default_value = "/etc/featured.toml")]
    config: PathBuf,

    /// Data directory for persistent state. Overrides `data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the feature host until interrupted.
    Run {
        /// key=value pairs of feature gates. May be repeated; later values win.
        #[arg(long)]
        feature_gates: Vec<String>,

        /// MAJOR.MINOR version whose feature defaults to emulate.
        #[arg(long)]
        compatibility_version: Option<String>,

        /// Number of sync workers.
        #[arg(long)]
        workers: Option<usize>,

        /// Host name. Overrides `host.name`.
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the known feature gates and exit.
    Gates {
        #[arg(long)]
        feature_gates: Vec<String>,
    },

    /// Print the published Feature records of this host's class.
    Status,

    /// Set the desired enablement of a published feature. Needs the
    /// daemon stopped, since the store is opened exclusively.
    SetDesired {
        #[arg(long)]
        feature: String,

        #[arg(long, value_enum)]
        desired: Desired,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Desired {
    Enabled,
    Disabled,
    Clear,
}

impl From<Desired> for Option<Enablement> {
    fn from(d: Desired) -> Self {
        match d {
            Desired::Enabled => Some(Enablement::Enabled),
            Desired::Disabled => Some(Enablement::Disabled),
            Desired::Clear => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,featured=debug,featuregrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::from_file(&cli.config)?;
    Overrides {
        data_dir: cli.data_dir.clone(),
        ..Default::default()
    }
    .apply(&mut config);

    match cli.command {
        Command::Run {
            feature_gates,
            compatibility_version,
            workers,
            name,
        } => {
            let overrides = Overrides {
                data_dir: None,
                feature_gates,
                compatibility_version,
                workers,
                name,
            };
            overrides.apply(&mut config);
            run(config, overrides).await
        }
        Command::Gates { feature_gates } => {
            let gate = daemon::build_gate(&config, &feature_gates)?;
            println!("{}", gate.flag_help());
            Ok(())
        }
        Command::Status => {
            let store = daemon::open_store(&daemon::data_dir(&config))?;
            let records = store.list(&config.host.class)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::SetDesired { feature, desired } => {
            let store = daemon::open_store(&daemon::data_dir(&config))?;
            let record = store.set_desired(&config.host.class, &feature, desired.into())?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig, overrides: Overrides) -> anyhow::Result<()> {
    // ── Shutdown signal ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(
        class = %config.host.class,
        host = %config.host.name,
        version = %config.host.version,
        "featured starting"
    );
    daemon::run(config, &overrides.feature_gates, shutdown_rx).await?;
    info!("featured stopped");
    Ok(())
}
