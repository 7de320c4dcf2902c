//! Sharder node.
//!
//! ```bash
//! sharder --keys-file keys/sharder.txt --config config/sharder.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sharder::{account, config, node};

#[derive(Parser, Debug)]
#[command(name = "sharder")]
#[command(version, about, long_about = None)]
struct Args {
    /// Node configuration file
    #[arg(long, default_value = "config/sharder.toml")]
    config: PathBuf,

    /// Node key material: public key hex, then secret key hex
    #[arg(long)]
    keys_file: PathBuf,

    /// Overrides server.deployment_mode from the config file
    #[arg(long, value_enum)]
    deployment_mode: Option<config::DeploymentMode>,
}

fn init_tracing(cfg: &config::Config) {
    let default = if cfg.development() { "sharder=debug" } else { "sharder=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if cfg.development() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut cfg = match config::Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(mode) = args.deployment_mode {
        cfg.server.deployment_mode = mode;
    }
    init_tracing(&cfg);

    let kp = match account::Keypair::from_file(&args.keys_file) {
        Ok(kp) => kp,
        Err(e) => {
            error!(error = %e, "cannot load node keys");
            return ExitCode::FAILURE;
        }
    };
    let node = match node::Node::from_config(cfg, kp) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
        }
        shutdown.cancel();
    });

    match node.run(token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sharder failed");
            ExitCode::FAILURE
        }
    }
}
