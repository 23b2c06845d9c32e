// Play one seat of a session from the command line.
//
// Connects to the hub, joins the session's authority (retrying until it is
// up), and answers every turn request with a stock decider. The session
// scope comes from an optional TOML session file, then the
// `TURNHUB_SESSION_ID` / `TURNHUB_AUTHORITY_ID` environment variables, then
// the flags below. Prints the outcome as one JSON line on stdout when the
// game ends. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use turnhub_authority::{
    Decider, FirstLegal, PlayerAgent, PlayerExit, RandomLegal, RunOptions, SessionConfig,
    run_participant,
};
use turnhub_protocol::types::{ParticipantId, SessionId};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    /// Always the first legal action
    First,
    /// A uniformly random legal action
    Random,
}

#[derive(Parser)]
#[command(name = "player")]
#[command(about = "Join a turnhub session and play it with a stock strategy", long_about = None)]
struct Args {
    /// Participant id to register as
    #[arg(long)]
    id: String,

    /// Session to join [default: $TURNHUB_SESSION_ID, or the config file's]
    #[arg(short, long)]
    session: Option<String>,

    /// Participant id of the session's authority
    #[arg(long)]
    moderator: Option<String>,

    /// Hub address
    #[arg(long)]
    hub: Option<String>,

    /// Session file (TOML) to read hub, scope, and heartbeat from
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How to pick actions
    #[arg(long, value_enum, default_value_t = Strategy::Random)]
    decider: Strategy,

    /// Seed for the random strategy
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => match SessionConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load session config");
                return ExitCode::FAILURE;
            }
        },
        None => SessionConfig::default(),
    };
    config.apply_env();
    if let Some(session) = args.session.clone() {
        config.session_id = SessionId::new(session);
    }
    if let Some(moderator) = args.moderator.clone() {
        config.authority_id = ParticipantId::new(moderator);
    }
    if let Some(hub) = args.hub.clone() {
        config.hub_addr = hub;
    }

    match args.decider {
        Strategy::First => play(&args, &config, FirstLegal),
        Strategy::Random => play(&args, &config, RandomLegal::new(args.seed)),
    }
}

fn play<D: Decider>(args: &Args, config: &SessionConfig, decider: D) -> ExitCode {
    let id = ParticipantId::new(args.id.clone());
    let options = RunOptions::for_session(config, id.clone());
    let mut player = PlayerAgent::new(
        id,
        config.session_id.clone(),
        config.authority_id.clone(),
        decider,
    );
    info!(
        session = %config.session_id,
        authority = %config.authority_id,
        hub = %config.hub_addr,
        "joining session"
    );

    if let Err(e) = run_participant(&mut player, &options) {
        error!(error = %e, "player failed");
        return ExitCode::FAILURE;
    }
    match player.exit() {
        Some(PlayerExit::Finished(outcome)) => {
            match serde_json::to_string(outcome) {
                Ok(line) => println!("{line}"),
                Err(e) => error!(error = %e, "failed to encode outcome"),
            }
            ExitCode::SUCCESS
        }
        Some(PlayerExit::Rejected(reason)) => {
            error!(%reason, "join rejected");
            ExitCode::FAILURE
        }
        Some(PlayerExit::AuthorityLost) => {
            error!("authority went away mid-game");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}
