// Follow a session from the command line.
//
// Connects to the hub as an observer, asks the authority for a snapshot, and
// prints every state delta from then on as one JSON line on stdout. Exits
// after the terminal delta unless `--follow` is given. Logs go to stderr.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use turnhub_authority::config::{DEFAULT_AUTHORITY_ID, DEFAULT_HUB_ADDR, SESSION_ID_ENV};
use turnhub_authority::{RunOptions, Viewer, run_participant};
use turnhub_protocol::types::{ParticipantId, SessionId};

#[derive(Parser)]
#[command(name = "watch")]
#[command(about = "Print a turnhub session's state deltas as JSON lines", long_about = None)]
struct Args {
    /// Hub address
    #[arg(long, default_value = DEFAULT_HUB_ADDR)]
    hub: String,

    /// Session to follow
    #[arg(short, long, env = SESSION_ID_ENV)]
    session: String,

    /// Participant id of the session's authority
    #[arg(long, default_value = DEFAULT_AUTHORITY_ID)]
    authority: String,

    /// Participant id to register as
    #[arg(long, default_value = "watcher")]
    id: String,

    /// Keep running after the game ends
    #[arg(short, long)]
    follow: bool,

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

    let session = SessionId::new(args.session);
    let mut viewer = Viewer::new(session.clone(), ParticipantId::new(args.authority))
        .with_sink(|delta| match serde_json::to_string(delta) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(error = %e, "failed to encode delta"),
        });
    if args.follow {
        viewer = viewer.keep_running();
    }

    let options = RunOptions::new(args.hub, session, ParticipantId::new(args.id));
    match run_participant(&mut viewer, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "watch failed");
            ExitCode::FAILURE
        }
    }
}
