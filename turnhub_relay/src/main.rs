// CLI entry point for the turnhub message hub.
//
// Starts a standalone hub that authorities, players, and observers connect
// to. The hub relays opaque payloads between them and never runs game logic.
// See `server.rs` for the networking architecture and `hub.rs` for the state.
//
// Settings come from `HubConfig::default()`, then the `--config` TOML file if
// given, then individual flags. Log verbosity follows `RUST_LOG` when set,
// otherwise `info` (or `debug` with `-v`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use turnhub_relay::config::HubConfig;
use turnhub_relay::server::start_hub;

#[derive(Parser)]
#[command(name = "hub")]
#[command(about = "Relay hub for turn-based game sessions", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:50060
    #[arg(short, long)]
    bind: Option<String>,

    /// Messages held per disconnected recipient
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Milliseconds of silence before a participant is declared unreachable
    #[arg(long)]
    liveness_timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => match HubConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => HubConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue_capacity = capacity;
    }
    if let Some(timeout) = args.liveness_timeout_ms {
        config.liveness_timeout_ms = timeout;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    match start_hub(config) {
        Ok((handle, _addr)) => {
            // Runs until the process is killed.
            handle.wait();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to start hub");
            ExitCode::FAILURE
        }
    }
}
