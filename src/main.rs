mod backup;
mod consultation;
mod db;
mod grading;
mod ipc;
mod schedule;
mod timers;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Academy management sidecar. Speaks one JSON request per line on stdin
/// and answers one JSON response per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "academyd", version)]
struct Args {
    /// Workspace directory to open before reading requests.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Default log filter when ACADEMYD_LOG is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ACADEMYD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn write_line(stdout: &mut io::Stdout, resp: &serde_json::Value) {
    let line = serde_json::to_string(resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace.as_deref() {
        ipc::open_workspace(&mut state, path)?;
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                write_line(&mut stdout, &ipc::bad_json(e.to_string()));
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
    }
    Ok(())
}
