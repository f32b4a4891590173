//! Data structures describing the servers to launch.
//!
//! This module defines the specification for a single server (`ServerSpec`) and the
//! validated launch plan (`LaunchPlan`) built from the command line, including the
//! shell-word splitting used to turn a command string into an executable and arguments.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use crate::readiness::ReadinessProbe;

/// Specification for a server to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    /// The raw command string, as given on the command line.
    pub command: String,
    /// The executable, split from `command`.
    pub program: String,
    /// Arguments for the executable.
    pub args: Vec<String>,
    /// TCP port the server is expected to listen on.
    pub port: u16,
    /// Working directory (defaults to the caller's).
    pub cwd: Option<PathBuf>,
}

impl ServerSpec {
    /// Creates a spec from a command string, splitting it into program and arguments.
    pub fn new(command: &str, port: u16, cwd: Option<PathBuf>) -> Result<Self> {
        let (program, args) = split_command(command)?;
        Ok(Self {
            command: command.to_string(),
            program,
            args,
            port,
            cwd,
        })
    }
}

/// Timing and probing settings applied to every server in a run.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// How long to wait for each server's port to open.
    pub startup_timeout: std::time::Duration,
    /// How long to wait after a graceful termination request before killing.
    pub grace_period: std::time::Duration,
    /// How readiness is probed.
    pub probe: ReadinessProbe,
}

/// A validated run: the servers to start, in order, and the command to run afterwards.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub servers: Vec<ServerSpec>,
    pub command: Vec<String>,
    pub settings: LaunchSettings,
}

impl LaunchPlan {
    /// Pairs the parallel server/port/cwd lists and validates the trailing command.
    ///
    /// Nothing is spawned here; every error is a usage error.
    pub fn build(
        servers: &[String],
        ports: &[u16],
        cwds: &[PathBuf],
        command: Vec<String>,
        settings: LaunchSettings,
    ) -> Result<Self> {
        let command = strip_separator(command);
        if command.is_empty() {
            bail!("no command specified to run");
        }
        if servers.len() != ports.len() {
            bail!(
                "number of --server and --port arguments must match ({} vs {})",
                servers.len(),
                ports.len()
            );
        }
        if !cwds.is_empty() && cwds.len() != servers.len() {
            bail!(
                "number of --cwd arguments must match --server count ({} vs {})",
                cwds.len(),
                servers.len()
            );
        }

        let servers = servers
            .iter()
            .zip(ports)
            .enumerate()
            .map(|(idx, (cmd, port))| {
                ServerSpec::new(cmd, *port, cwds.get(idx).cloned())
                    .with_context(|| format!("invalid --server #{}", idx + 1))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            servers,
            command,
            settings,
        })
    }
}

/// Splits a command string into an executable and its arguments.
///
/// Quoting and escaping follow POSIX shell rules; no shell is invoked.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = shell_words::split(command)
        .with_context(|| format!("failed to parse command {}", command))?;
    if parts.is_empty() {
        return Err(anyhow!("empty command"));
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Renders an argv back into a single shell-quoted string for display.
pub fn format_command(parts: &[String]) -> String {
    shell_words::join(parts)
}

// The trailing var-arg may still carry the `--` separator as its first token.
fn strip_separator(mut command: Vec<String>) -> Vec<String> {
    if command.first().map(String::as_str) == Some("--") {
        command.remove(0);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> LaunchSettings {
        LaunchSettings {
            startup_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            probe: ReadinessProbe::default(),
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn pairs_servers_ports_and_cwds_in_order() {
        let plan = LaunchPlan::build(
            &strings(&["python server.py", "npm run dev"]),
            &[3000, 5173],
            &[PathBuf::from("backend"), PathBuf::from("frontend")],
            strings(&["--", "python", "test.py"]),
            settings(),
        )
        .unwrap();
        assert_eq!(plan.servers.len(), 2);
        assert_eq!(plan.servers[0].program, "python");
        assert_eq!(plan.servers[0].args, vec!["server.py"]);
        assert_eq!(plan.servers[0].port, 3000);
        assert_eq!(plan.servers[0].cwd, Some(PathBuf::from("backend")));
        assert_eq!(plan.servers[1].program, "npm");
        assert_eq!(plan.servers[1].port, 5173);
        assert_eq!(plan.servers[1].cwd, Some(PathBuf::from("frontend")));
        assert_eq!(plan.command, vec!["python", "test.py"]);
    }

    #[test]
    fn missing_cwds_default_to_none() {
        let plan = LaunchPlan::build(
            &strings(&["a", "b"]),
            &[1, 2],
            &[],
            strings(&["check"]),
            settings(),
        )
        .unwrap();
        assert!(plan.servers.iter().all(|s| s.cwd.is_none()));
    }

    #[test]
    fn rejects_mismatched_server_and_port_counts() {
        let err = LaunchPlan::build(
            &strings(&["a", "b"]),
            &[1],
            &[],
            strings(&["check"]),
            settings(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--server and --port"));
    }

    #[test]
    fn rejects_partial_cwd_list() {
        let err = LaunchPlan::build(
            &strings(&["a", "b"]),
            &[1, 2],
            &[PathBuf::from(".")],
            strings(&["check"]),
            settings(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--cwd"));
    }

    #[test]
    fn rejects_empty_trailing_command() {
        let err = LaunchPlan::build(&strings(&["a"]), &[1], &[], Vec::new(), settings())
            .unwrap_err();
        assert!(err.to_string().contains("no command"));

        // A bare separator leaves nothing to run either.
        let err = LaunchPlan::build(&strings(&["a"]), &[1], &[], strings(&["--"]), settings())
            .unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn strips_only_the_leading_separator() {
        let plan = LaunchPlan::build(
            &strings(&["a"]),
            &[1],
            &[],
            strings(&["--", "cargo", "test", "--", "--nocapture"]),
            settings(),
        )
        .unwrap();
        assert_eq!(plan.command, vec!["cargo", "test", "--", "--nocapture"]);
    }

    #[test]
    fn split_command_honors_quotes_and_escapes() {
        let (program, args) =
            split_command(r#"node "my server.js" --name 'a b' c\ d"#).unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["my server.js", "--name", "a b", "c d"]);
    }

    #[test]
    fn split_command_rejects_empty_and_unterminated() {
        assert!(split_command("   ").is_err());
        assert!(split_command("echo 'unterminated").is_err());
    }

    #[test]
    fn invalid_server_command_is_a_usage_error() {
        let err = LaunchPlan::build(
            &strings(&["ok", ""]),
            &[1, 2],
            &[],
            strings(&["check"]),
            settings(),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("--server #2"));
    }
}
