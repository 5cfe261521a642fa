//! Launching the simulator binary and relaying its output.
//!
//! `ChildProcessRunner::run` always resolves exactly once: on natural exit,
//! after a timeout kill, or with a launch failure. Failures are values in the
//! returned [`RunOutcome`], never errors, so the orchestrator loop has nothing
//! to catch.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::error::PanelError;
use crate::relay::{LogLevel, LogRelay};
use crate::types::SessionLabel;

/// How long to wait for the child to exit after it has been killed, and
/// again for its pipes to drain.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Per-stream cap on captured text. Lines past the cap are still relayed.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Arguments for a session attaching `ues` simulated devices.
pub fn session_args(ues: u32) -> Vec<String> {
    if ues <= 1 {
        vec!["ue".to_string()]
    } else {
        vec!["multi-ue".to_string(), "-n".to_string(), ues.to_string()]
    }
}

/// One invocation of the simulator.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub session: SessionLabel,
}

impl Invocation {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>, session: SessionLabel) -> Self {
        Self {
            executable: executable.into(),
            args,
            cwd: None,
            timeout: Duration::from_secs(30),
            session,
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub captured_output: String,
    pub captured_error: String,
    pub timed_out: bool,
    pub launch_error: Option<String>,
    pub timeout_ms: u64,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn launch_failed(message: impl Into<String>, timeout: Duration) -> Self {
        let message = message.into();
        Self {
            success: false,
            captured_error: message.clone(),
            launch_error: Some(message),
            timeout_ms: timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Classify an unsuccessful outcome.
    pub fn failure(&self) -> Option<PanelError> {
        if self.success {
            return None;
        }
        if let Some(msg) = &self.launch_error {
            return Some(PanelError::ProcessLaunch(msg.clone()));
        }
        if self.timed_out {
            return Some(PanelError::ProcessTimeout(self.timeout_ms));
        }
        Some(PanelError::ProcessExit(self.exit_code.unwrap_or(-1)))
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: Invocation, relay: &LogRelay) -> RunOutcome;
}

/// Runs the simulator as a tokio child process.
#[derive(Debug, Clone)]
pub struct ChildProcessRunner {
    kill_grace: Duration,
}

impl ChildProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Default for ChildProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

#[async_trait]
impl ProcessRunner for ChildProcessRunner {
    async fn run(&self, inv: Invocation, relay: &LogRelay) -> RunOutcome {
        let label = inv.session.clone();
        let timeout_ms = inv.timeout.as_millis() as u64;
        let started = std::time::Instant::now();

        let mut cmd = Command::new(&inv.executable);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &inv.cwd {
            cmd.current_dir(cwd);
        }

        debug!(
            session = %label,
            executable = %inv.executable.display(),
            args = ?inv.args,
            "spawning simulator"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("{}: {}", inv.executable.display(), e);
                warn!(session = %label, error = %e, "simulator launch failed");
                relay
                    .process_output(LogLevel::Error, &label, format!("launch failed: {msg}"))
                    .await;
                return RunOutcome::launch_failed(msg, inv.timeout);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut captured_output = String::new();
        let mut captured_error = String::new();

        let (status, timed_out) = {
            let mut pumps = Box::pin(async {
                tokio::join!(
                    pump(stdout, LogLevel::Info, relay, &label, &mut captured_output),
                    pump(stderr, LogLevel::Error, relay, &label, &mut captured_error),
                )
            });

            let kill_at = Instant::now() + inv.timeout;
            let mut abandon_at: Option<Instant> = None;
            let mut killed = false;
            let mut pumped = false;

            let status = loop {
                tokio::select! {
                    res = child.wait() => {
                        match res {
                            Ok(status) => break Some(status),
                            Err(e) => {
                                warn!(session = %label, error = %e, "waiting on simulator failed");
                                break None;
                            }
                        }
                    }
                    _ = &mut pumps, if !pumped => {
                        pumped = true;
                    }
                    _ = tokio::time::sleep_until(kill_at), if !killed => {
                        killed = true;
                        abandon_at = Some(Instant::now() + self.kill_grace);
                        warn!(session = %label, timeout_ms, "simulator timed out; killing");
                        if let Err(e) = child.start_kill() {
                            warn!(session = %label, error = %e, "failed to kill simulator");
                        }
                    }
                    _ = tokio::time::sleep_until(abandon_at.unwrap_or(kill_at)), if abandon_at.is_some() => {
                        warn!(session = %label, "simulator did not exit after kill; abandoning");
                        break None;
                    }
                }
            };

            if !pumped && timeout(self.kill_grace, &mut pumps).await.is_err() {
                warn!(session = %label, "output pipes still open after exit; stopped reading");
            }

            (status, killed)
        };

        let exit_code = status.and_then(|s| s.code());
        let duration_ms = started.elapsed().as_millis() as u64;

        if timed_out {
            relay
                .process_output(
                    LogLevel::Warning,
                    &label,
                    format!("terminated after {timeout_ms} ms timeout"),
                )
                .await;
        }

        info!(
            session = %label,
            exit_code = ?exit_code,
            timed_out,
            duration_ms,
            "simulator finished"
        );

        RunOutcome {
            success: !timed_out && exit_code == Some(0),
            exit_code,
            captured_output,
            captured_error,
            timed_out,
            launch_error: None,
            timeout_ms,
            duration_ms,
        }
    }
}

/// Relay `reader` line by line until EOF, appending to `sink` up to the cap.
async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    level: LogLevel,
    relay: &LogRelay,
    label: &SessionLabel,
    sink: &mut String,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if sink.len() + line.len() < MAX_CAPTURE_BYTES {
                    sink.push_str(&line);
                    sink.push('\n');
                }
                relay.process_output(level, label, line).await;
            }
            Err(e) => {
                warn!(session = %label, error = %e, "reading simulator output failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, timeout: Duration) -> Invocation {
        Invocation::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            SessionLabel::new("ue-test"),
        )
        .with_timeout(timeout)
    }

    #[test]
    fn args_follow_ue_count() {
        assert_eq!(session_args(1), ["ue"]);
        assert_eq!(session_args(5), ["multi-ue", "-n", "5"]);
    }

    #[tokio::test]
    async fn streams_and_captures_both_pipes() {
        let relay = LogRelay::new(50);
        let (_id, mut rx) = relay.subscribe().await;
        let runner = ChildProcessRunner::default();

        let outcome = runner
            .run(
                shell("echo one; echo two >&2; echo three", Duration::from_secs(10)),
                &relay,
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.captured_output, "one\nthree\n");
        assert_eq!(outcome.captured_error, "two\n");
        assert!(outcome.failure().is_none());

        let mut relayed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::relay::RelayEvent::Log(line) = event {
                relayed.push((line.message, line.level));
            }
        }
        assert!(relayed.contains(&("two".to_string(), LogLevel::Error)));
        assert!(relayed.contains(&("three".to_string(), LogLevel::Info)));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_outcome() {
        let relay = LogRelay::default();
        let outcome = ChildProcessRunner::default()
            .run(shell("echo bye; exit 3", Duration::from_secs(10)), &relay)
            .await;

        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.failure(), Some(PanelError::ProcessExit(3)));
    }

    #[tokio::test]
    async fn timeout_resolves_within_bound() {
        let relay = LogRelay::default();
        let runner = ChildProcessRunner::new(Duration::from_millis(300));
        let started = std::time::Instant::now();

        // The backgrounded sleep keeps the pipes open after sh is killed.
        let outcome = runner
            .run(
                shell("trap '' TERM INT; sleep 30 & sleep 30", Duration::from_millis(200)),
                &relay,
            )
            .await;

        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert_eq!(outcome.failure(), Some(PanelError::ProcessTimeout(200)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let relay = LogRelay::default();
        let outcome = ChildProcessRunner::default()
            .run(
                Invocation::new(
                    "/nonexistent/packetrusher",
                    session_args(1),
                    SessionLabel::new("ue-x"),
                ),
                &relay,
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.launch_error.is_some());
        assert_eq!(outcome.failure().unwrap().kind(), "ProcessLaunchError");
        assert_eq!(relay.snapshot().await.process_output_log.len(), 1);
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LogRelay::default();
        let outcome = ChildProcessRunner::default()
            .run(
                shell("pwd", Duration::from_secs(10))
                    .with_cwd(Some(dir.path().to_path_buf())),
                &relay,
            )
            .await;

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(outcome.captured_output.trim(), expected.to_str().unwrap());
    }
}
