//! Server execution and teardown.
//!
//! This module contains the `ServerManager`, which owns every server process started
//! during a run. It spawns servers one at a time, waits for their ports to open, and
//! guarantees that each of them is terminated again before the run finishes. The
//! `launch` function drives a whole run: startup, the trailing command, and teardown.

use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::output::{self, Reporter, StderrTail, STDERR_TAIL_BYTES};
use crate::process::{format_command, LaunchPlan, LaunchSettings, ServerSpec};
use crate::readiness::Readiness;

// How long to wait for a stopped server's stderr pipe to reach EOF.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Signals the launcher sends to servers or receives itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }

    /// Conventional shell exit status for a process ended by this signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessSignal::SigInt => 130,
            ProcessSignal::SigTerm => 143,
            ProcessSignal::SigKill => 137,
        }
    }
}

/// How a run ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The trailing command ran to completion with this exit code.
    Completed { code: i32 },
    /// The launcher itself was asked to stop before the command finished.
    Interrupted { signal: ProcessSignal },
}

impl LaunchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Completed { code } => *code,
            LaunchOutcome::Interrupted { signal } => signal.exit_code(),
        }
    }
}

/// A spawned server and its live process handle.
pub struct RunningProcess {
    /// 1-based position of the server on the command line.
    pub index: usize,
    pub spec: ServerSpec,
    child: Child,
    pid: Option<u32>,
    stderr: Option<JoinHandle<StderrTail>>,
}

impl RunningProcess {
    /// Spawns a server with piped output in its own process group.
    pub fn spawn(index: usize, spec: ServerSpec) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn server: {}", spec.command))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(output::discard(stdout));
        }
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(output::capture_tail(stderr, STDERR_TAIL_BYTES)));

        Ok(Self {
            index,
            spec,
            child,
            pid,
            stderr,
        })
    }

    /// Returns the exit status if the process has already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Stops the process: SIGTERM, wait up to `grace`, then SIGKILL and reap.
    ///
    /// Safe to call on a process that has already exited, any number of times.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        terminate_child(&mut self.child, self.pid, grace)
            .await
            .with_context(|| format!("failed to reap server: {}", self.spec.command))
    }

    /// Collects whatever the process wrote to stderr.
    ///
    /// Meant for a process that has been stopped; gives up if the pipe stays open.
    pub async fn collect_stderr(&mut self) -> Vec<u8> {
        let Some(mut handle) = self.stderr.take() else {
            return Vec::new();
        };
        match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle).await {
            Ok(Ok(tail)) => tail.into_bytes(),
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                handle.abort();
                Vec::new()
            }
        }
    }
}

/// Owns the set of running servers for the duration of a run.
///
/// Dropping the manager force-kills anything still tracked; `shutdown_all` is the
/// graceful path and should be awaited on every normal exit.
pub struct ServerManager {
    processes: Vec<RunningProcess>,
    grace_period: Duration,
    reporter: Reporter,
}

impl ServerManager {
    pub fn new(grace_period: Duration, reporter: Reporter) -> Self {
        Self {
            processes: Vec::new(),
            grace_period,
            reporter,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    #[cfg(test)]
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(|p| p.pid).collect()
    }

    /// Starts one server and blocks until its port opens.
    ///
    /// A server that times out or fails early is stopped, its stderr is reported, and
    /// it is no longer tracked when the error is returned.
    pub async fn start_server(
        &mut self,
        index: usize,
        total: usize,
        spec: &ServerSpec,
        settings: &LaunchSettings,
    ) -> Result<()> {
        let cwd_info = spec
            .cwd
            .as_ref()
            .map(|cwd| format!(" (cwd: {})", cwd.display()))
            .unwrap_or_default();
        self.reporter.status(format!(
            "starting server {}/{}: {}{}",
            index, total, spec.command, cwd_info
        ));

        let process = RunningProcess::spawn(index, spec.clone())?;
        self.processes.push(process);
        let slot = self.processes.len() - 1;

        self.reporter
            .status(format!("waiting for server on port {}", spec.port));
        let readiness = {
            let process = &mut self.processes[slot];
            settings
                .probe
                .wait_until_ready(spec.port, settings.startup_timeout, || {
                    process.try_exit_status()
                })
                .await
        };

        let failure = match readiness {
            Readiness::Ready => {
                self.reporter
                    .status(format!("server ready on port {}", spec.port));
                return Ok(());
            }
            Readiness::TimedOut => anyhow!(
                "server failed to start on port {} within {:?}",
                spec.port,
                settings.startup_timeout
            ),
            Readiness::Exited(status) => anyhow!(
                "server exited ({}) before port {} opened",
                status,
                spec.port
            ),
        };

        let mut process = self.processes.remove(slot);
        if let Err(err) = process.terminate(self.grace_period).await {
            self.reporter.warn(format!("{:#}", err));
        }
        let stderr = process.collect_stderr().await;
        self.reporter.server_stderr(&stderr);
        Err(failure)
    }

    /// Stops every tracked server, gracefully where possible.
    pub async fn shutdown_all(&mut self) {
        self.reporter
            .status(format!("stopping {} server(s)", self.processes.len()));
        let processes = std::mem::take(&mut self.processes);
        for mut process in processes {
            match process.terminate(self.grace_period).await {
                Ok(_) => self
                    .reporter
                    .status(format!("server {} stopped", process.index)),
                Err(err) => self.reporter.warn(format!(
                    "server {} may still be running: {:#}",
                    process.index, err
                )),
            }
        }
        self.reporter.status("all servers stopped");
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        for process in &mut self.processes {
            kill_child(&mut process.child, process.pid);
        }
    }
}

/// Runs a whole launch: start servers in order, run the command, tear everything down.
///
/// `shutdown` resolves when the launcher itself is asked to stop. Startup is then
/// abandoned, or the running command gets the same SIGTERM-then-kill sequence as a
/// server, and teardown runs.
pub async fn launch<S>(plan: &LaunchPlan, reporter: Reporter, shutdown: S) -> Result<LaunchOutcome>
where
    S: Future<Output = ProcessSignal>,
{
    tokio::pin!(shutdown);
    let mut manager = ServerManager::new(plan.settings.grace_period, reporter.clone());
    let result = run_phases(plan, &mut manager, &reporter, shutdown).await;
    manager.shutdown_all().await;
    result
}

async fn run_phases<S>(
    plan: &LaunchPlan,
    manager: &mut ServerManager,
    reporter: &Reporter,
    mut shutdown: Pin<&mut S>,
) -> Result<LaunchOutcome>
where
    S: Future<Output = ProcessSignal>,
{
    let started = tokio::select! {
        result = start_all(plan, manager) => Ok(result),
        signal = shutdown.as_mut() => Err(signal),
    };
    match started {
        Ok(result) => result?,
        Err(signal) => return Ok(interrupted(reporter, signal)),
    }
    reporter.status(format!("all {} server(s) ready", plan.servers.len()));

    let mut command = spawn_command(&plan.command, reporter)?;
    let finished = tokio::select! {
        status = command.wait() => Ok(status),
        signal = shutdown.as_mut() => Err(signal),
    };
    match finished {
        Ok(status) => {
            let status = status.context("failed to wait for command")?;
            Ok(LaunchOutcome::Completed {
                code: exit_code(status),
            })
        }
        Err(signal) => {
            let outcome = interrupted(reporter, signal);
            reporter.status("stopping command");
            let pid = command.id();
            if let Err(err) = terminate_child(&mut command, pid, plan.settings.grace_period).await {
                reporter.warn(format!("command may still be running: {:#}", err));
            }
            Ok(outcome)
        }
    }
}

async fn start_all(plan: &LaunchPlan, manager: &mut ServerManager) -> Result<()> {
    let total = plan.servers.len();
    for (idx, spec) in plan.servers.iter().enumerate() {
        manager
            .start_server(idx + 1, total, spec, &plan.settings)
            .await?;
    }
    Ok(())
}

fn interrupted(reporter: &Reporter, signal: ProcessSignal) -> LaunchOutcome {
    reporter.warn(format!("received {}, shutting down", signal.label()));
    LaunchOutcome::Interrupted { signal }
}

/// Spawns the trailing command in the foreground, sharing this process's stdio.
pub fn spawn_command(command: &[String], reporter: &Reporter) -> Result<Child> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command specified to run");
    };
    reporter.status(format!("running: {}", format_command(command)));
    Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to run {}", program))
}

/// Maps an exit status to a shell-style exit code.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

// SIGTERM, wait up to `grace`, then SIGKILL and reap. An already-reaped child
// returns its cached status without being signalled.
async fn terminate_child(child: &mut Child, pid: Option<u32>, grace: Duration) -> Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }
    if let Some(pid) = pid {
        send_os_signal(pid, ProcessSignal::SigTerm);
    }
    if let Some(status) = wait_for_exit(child, grace).await? {
        return Ok(status);
    }
    kill_child(child, pid);
    Ok(child.wait().await?)
}

// Sends SIGKILL without waiting. Used where awaiting is impossible.
fn kill_child(child: &mut Child, pid: Option<u32>) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Some(pid) = pid {
        send_os_signal(pid, ProcessSignal::SigKill);
    }
    let _ = child.start_kill();
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // SIGKILL has no console equivalent; Child::start_kill covers it.
    if signal == ProcessSignal::SigKill {
        return;
    }
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}
