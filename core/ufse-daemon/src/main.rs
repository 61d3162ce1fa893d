//! UFSE daemon entrypoint.
//!
//! A single-process service: events arrive over a Unix socket, the session
//! manager decides when each session is done, and a pipeline worker turns
//! completed sessions into incidents appended to a JSON Lines log.
//! `replay` runs the same pipeline offline over a recorded event file.

use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ufse_core::{load_detection_config, DetectionConfig};

mod paths;
mod replay;
mod server;
mod worker;

#[derive(Debug, Parser)]
#[command(name = "ufse-daemon", version, about = "User frustration signal engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for events and write incidents until killed.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(long)]
        incidents: Option<PathBuf>,
        /// Write logs to a daily rolling file in this directory instead of stderr.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Run the pipeline over a JSON Lines file of events and print incidents.
    Replay {
        events: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            socket,
            incidents,
            log_dir,
        } => {
            let _guard = init_logging(log_dir.as_deref());
            let options = server::ServeOptions {
                config: load_config(config),
                socket_path: socket,
                incidents_path: incidents,
            };
            match server::serve(options) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(error = %err, "Daemon stopped");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Replay { events, config } => {
            let _guard = init_logging(None);
            match replay::run(&events, load_config(config)) {
                Ok(summary) => {
                    eprintln!(
                        "{} sessions, {} incidents, {} shadowed",
                        summary.sessions, summary.incidents, summary.shadowed
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(error = %err, path = %events.display(), "Replay failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// A bad config file is not fatal: the daemon keeps running on defaults.
fn load_config(path: Option<PathBuf>) -> DetectionConfig {
    match load_detection_config(path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load detection config; using defaults");
            DetectionConfig::default()
        }
    }
}

fn init_logging(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let debug_enabled = env::var("UFSE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ufse-daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
