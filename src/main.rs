//! Portgate: start servers, wait for their ports, run a command, clean up.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! resolves them into a validated launch plan, installs the signal listener, and
//! hands control to the runner, whose exit code becomes the process exit code.

mod output;
mod process;
mod readiness;
mod runner;

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;

use crate::output::Reporter;
use crate::process::{LaunchPlan, LaunchSettings};
use crate::readiness::{ReadinessProbe, CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_POLL_INTERVAL_MS};
use crate::runner::ProcessSignal;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_GRACE_SECS: u64 = 5;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "portgate",
    version,
    about = "Start servers, wait until their ports accept connections, run a command, then stop the servers",
    after_help = "Examples:\n  portgate --server \"npm run dev\" --port 5173 -- python test.py\n  portgate --server \"python server.py\" --port 3000 --cwd backend \\\n           --server \"npm run dev\" --port 5173 --cwd frontend -- python test.py",
    styles = help_styles(),
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Server command (repeatable). Split like a shell would, but no shell is run.
    #[arg(long = "server", value_name = "COMMAND", required = true)]
    servers: Vec<String>,
    /// Port for each server (must match --server count).
    #[arg(long = "port", value_name = "PORT", required = true)]
    ports: Vec<u16>,
    /// Working directory for each server (optional, must match --server count if used).
    #[arg(long = "cwd", value_name = "DIR")]
    cwds: Vec<PathBuf>,
    /// Timeout in seconds per server.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    /// Seconds to wait after SIGTERM before killing a server.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_GRACE_SECS)]
    grace_period: u64,
    /// Host used for readiness checks.
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    /// Delay between readiness checks (ms).
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
    /// Use a plain "[portgate]" prefix for status lines.
    #[arg(long)]
    no_symbols: bool,
    /// Only print errors and failed server output.
    #[arg(long, short)]
    quiet: bool,
    /// Command to run once every server is ready: -- <cmd> [args...]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn settings(&self) -> LaunchSettings {
        LaunchSettings {
            startup_timeout: Duration::from_secs(self.timeout),
            grace_period: Duration::from_secs(self.grace_period),
            probe: ReadinessProbe {
                host: self.host.clone(),
                connect_timeout: CONNECT_TIMEOUT,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
        }
    }

    fn into_plan(self) -> Result<LaunchPlan> {
        let settings = self.settings();
        LaunchPlan::build(&self.servers, &self.ports, &self.cwds, self.command, settings)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let reporter = Reporter::new(!cli.no_symbols, cli.quiet);
    let plan = cli.into_plan()?;

    let shutdown = shutdown_signal()?;
    let outcome = runner::launch(&plan, reporter, shutdown).await?;
    Ok(exit_status(outcome.exit_code()))
}

fn exit_status(code: i32) -> ExitCode {
    // Codes outside 0..=255 are truncated by the OS anyway; keep failures non-zero.
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ProcessSignal>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => ProcessSignal::SigInt,
            _ = sigterm.recv() => ProcessSignal::SigTerm,
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ProcessSignal>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        ProcessSignal::SigInt
    })
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
