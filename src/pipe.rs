//! Chained external processes with drained diagnostics.
//!
//! A [`ProcessChain`] owns one or more children wired stdout → stdin. Each
//! child's stderr is drained by its own task for the child's whole lifetime, so
//! a chatty process never blocks on a full pipe. The drains belong to the chain
//! and are joined or aborted together with the processes.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Lines of stderr kept per process for error reports.
pub const DIAGNOSTIC_LINES: usize = 20;

const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command waiting to be spawned as part of a chain.
pub struct Stage {
    label: String,
    command: Command,
}

impl Stage {
    pub fn new(label: impl Into<String>, command: Command) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }
}

/// Bounded buffer holding the most recent diagnostic lines of one process.
#[derive(Clone, Debug)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

struct RunningStage {
    label: String,
    child: Child,
    /// Process group led by the child; helpers it starts share it.
    group: Option<Pid>,
    diagnostics: DiagnosticTail,
    drain: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
    killed: bool,
}

impl RunningStage {
    fn kill_group(&self) {
        let Some(group) = self.group else {
            return;
        };
        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(stage = %self.label, error = %err, "failed to signal process group"),
        }
    }
}

impl Drop for RunningStage {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.kill_group();
            let _ = self.child.start_kill();
        }
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

/// One or more running processes, the terminal one's stdout exposed to the
/// caller.
pub struct ProcessChain {
    stages: Vec<RunningStage>,
    stdout: Option<ChildStdout>,
}

impl ProcessChain {
    /// Spawns every stage, wiring each stdout into the next stage's stdin.
    ///
    /// The parent's copy of each intermediate pipe is closed as soon as the
    /// downstream child owns it, so an upstream writer sees a broken pipe when
    /// its reader exits early.
    pub fn spawn(stages: Vec<Stage>) -> GatewayResult<Self> {
        if stages.is_empty() {
            return Err(GatewayError::internal("process chain has no stages"));
        }

        let mut running: Vec<RunningStage> = Vec::with_capacity(stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for Stage { label, mut command } in stages {
            let stdin: Stdio = match upstream.take() {
                Some(stdout) => stdout.try_into()?,
                None => Stdio::null(),
            };
            command
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true);

            let spawned = command.spawn();
            // The command still holds the upstream read end until dropped.
            drop(command);
            let mut child = spawned.map_err(|err| GatewayError::from_spawn(&label, err))?;
            let group = child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw);
            debug!(stage = %label, pid = child.id(), "process spawned");

            let diagnostics = DiagnosticTail::new(DIAGNOSTIC_LINES);
            let drain = child.stderr.take().map(|stderr| {
                tokio::spawn(drain_diagnostics(
                    label.clone(),
                    stderr,
                    diagnostics.clone(),
                ))
            });
            upstream = child.stdout.take();
            running.push(RunningStage {
                label,
                child,
                group,
                diagnostics,
                drain,
                status: None,
                killed: false,
            });
        }

        Ok(Self {
            stages: running,
            stdout: upstream,
        })
    }

    /// Convenience for a chain of exactly one process.
    pub fn single(label: impl Into<String>, command: Command) -> GatewayResult<Self> {
        Self::spawn(vec![Stage::new(label, command)])
    }

    /// Hands the terminal process's stdout to the caller.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.stages
            .iter()
            .filter_map(|stage| stage.child.id())
            .collect()
    }

    /// Waits up to `timeout` for every stage to exit, then cleans up
    /// unconditionally. Stages still running at the deadline are killed and
    /// not reported as failures; any stage that exited unsuccessfully is.
    pub async fn finish(&mut self, timeout: Duration) -> GatewayResult<()> {
        self.stdout.take();
        let deadline = Instant::now() + timeout;

        for stage in &mut self.stages {
            if stage.status.is_some() {
                continue;
            }
            match tokio::time::timeout_at(deadline, stage.child.wait()).await {
                Ok(Ok(status)) => stage.status = Some(status),
                Ok(Err(err)) => {
                    warn!(stage = %stage.label, error = %err, "waiting for process failed");
                }
                Err(_) => {
                    warn!(stage = %stage.label, "process did not exit in time");
                }
            }
        }

        self.shutdown().await;

        match self
            .stages
            .iter()
            .find(|stage| !stage.killed && stage.status.is_some_and(|status| !status.success()))
        {
            Some(stage) => Err(GatewayError::failed(
                &stage.label,
                stage.status,
                &stage.diagnostics.snapshot(),
            )),
            None => Ok(()),
        }
    }

    /// Kills the process group of every stage that is still running, reaps
    /// the stage, and joins the diagnostic drains. Idempotent.
    pub async fn shutdown(&mut self) {
        self.stdout.take();

        for stage in &mut self.stages {
            if stage.status.is_some() {
                continue;
            }
            match stage.child.try_wait() {
                Ok(Some(status)) => stage.status = Some(status),
                _ => {
                    stage.kill_group();
                    if let Err(err) = stage.child.start_kill() {
                        debug!(stage = %stage.label, error = %err, "process already gone");
                    }
                    match stage.child.wait().await {
                        Ok(status) => stage.status = Some(status),
                        Err(err) => {
                            warn!(stage = %stage.label, error = %err, "failed to reap process");
                        }
                    }
                    stage.killed = true;
                    debug!(stage = %stage.label, "process killed");
                }
            }
        }

        for stage in &mut self.stages {
            if let Some(mut drain) = stage.drain.take()
                && tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut drain)
                    .await
                    .is_err()
            {
                drain.abort();
            }
        }
    }

    /// Runs the chain to completion and returns the terminal stdout.
    ///
    /// Used for materializing runs whose real output goes to disk; stdout then
    /// only carries short reports such as printed file paths.
    pub async fn collect_stdout(mut self, exit_timeout: Duration) -> GatewayResult<Vec<u8>> {
        let mut collected = Vec::new();
        if let Some(mut stdout) = self.stdout.take()
            && let Err(err) = stdout.read_to_end(&mut collected).await
        {
            self.shutdown().await;
            return Err(GatewayError::Io(err));
        }
        self.finish(exit_timeout).await?;
        Ok(collected)
    }
}

async fn drain_diagnostics(label: String, stderr: ChildStderr, tail: DiagnosticTail) {
    let mut segments = BufReader::new(stderr).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match parse_progress(&line) {
                    Some(percent) => debug!(stage = %label, percent, "progress"),
                    None => debug!(stage = %label, "{line}"),
                }
                tail.push(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(stage = %label, error = %err, "diagnostic stream closed");
                break;
            }
        }
    }
}

/// Extracts the percentage from a fetch-engine progress line such as
/// `[download]  42.3% of 10.00MiB at 1.00MiB/s`.
pub fn parse_progress(line: &str) -> Option<f32> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let (number, _) = rest.split_once('%')?;
    let value: f32 = number.trim().parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// Wraps an I/O error from the body stream with the chain's context.
pub fn stream_error(err: GatewayError) -> io::Error {
    io::Error::other(err.to_string())
}
