//! Host command execution
//!
//! Everything netlab runs on the host itself (`ip`, `ethtool`, `nsenter`,
//! `iptables`, `ovs-vsctl`, host exec) goes through [`CommandExecutor`] so
//! it can be replaced by [`MockCommandExecutor`] in tests.

use crate::config::defaults::DEFAULT_HOST_COMMAND_TIMEOUT_SECS;
use crate::error::{NetlabError, NetlabResult};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// `program arg1 arg2 ...`, for logs and errors
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Captured result of one host command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; -1 when the process was killed by a signal
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl CommandOutput {
    /// Exit code 0 with the given stdout
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
            success: true,
            duration: Duration::ZERO,
        }
    }

    /// Non-zero exit with the given stderr
    pub fn failed(status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into(),
            success: false,
            duration: Duration::ZERO,
        }
    }

    fn from_process(output: std::process::Output, elapsed: Duration) -> Self {
        Self {
            status: exit_code(&output.status),
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: elapsed,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[cfg(unix)]
fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => {
            warn!(signal, "command killed by signal");
            -1
        }
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Runs programs on the host
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args`; `timeout` overrides the executor default
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> NetlabResult<CommandOutput>;

    async fn execute_simple(&self, program: &str, args: &[&str]) -> NetlabResult<CommandOutput> {
        self.execute(program, args, None).await
    }
}

/// [`CommandExecutor`] spawning real processes with `tokio::process`
#[derive(Debug, Clone)]
pub struct TokioCommandExecutor {
    timeout: Duration,
}

impl TokioCommandExecutor {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_HOST_COMMAND_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for TokioCommandExecutor {
    #[instrument(skip_all, fields(program = program))]
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> NetlabResult<CommandOutput> {
        let line = command_line(program, args);
        debug!(command = %line, "running host command");

        let started = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // a timed-out child must not outlive the future
            .kill_on_drop(true);

        let limit = timeout.unwrap_or(self.timeout);
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| NetlabError::Timeout {
                operation: line.clone(),
                duration: limit,
            })??;

        let result = CommandOutput::from_process(output, started.elapsed());
        if !result.success {
            warn!(
                command = %line,
                status = result.status,
                stderr = %result.stderr_lossy().trim(),
                "host command failed"
            );
        }
        Ok(result)
    }
}

struct Expectation {
    line: Vec<String>,
    response: NetlabResult<CommandOutput>,
}

/// Scripted [`CommandExecutor`]
///
/// Each expected command line is answered once, in any order. Other
/// commands get the fallback output, or an error when none is set. Clones
/// share their script and history.
#[derive(Clone, Default)]
pub struct MockCommandExecutor {
    expected: Arc<Mutex<VecDeque<Expectation>>>,
    history: Arc<Mutex<Vec<Vec<String>>>>,
    fallback: Arc<Mutex<Option<CommandOutput>>>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `program args...` with `response`
    pub fn expect(&self, program: &str, args: &[&str], response: NetlabResult<CommandOutput>) {
        let mut line = vec![program.to_string()];
        line.extend(args.iter().map(|a| a.to_string()));
        self.expected.lock().push_back(Expectation { line, response });
    }

    /// Answer every unexpected command with `output`
    pub fn with_fallback(self, output: CommandOutput) -> Self {
        *self.fallback.lock() = Some(output);
        self
    }

    /// Every command line executed so far, program first
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.history.lock().clone()
    }

    /// Fails while expected commands are still pending
    pub fn verify(&self) -> NetlabResult<()> {
        let expected = self.expected.lock();
        match expected.front() {
            None => Ok(()),
            Some(first) => Err(NetlabError::internal(format!(
                "{} expected command(s) never ran, first: {}",
                expected.len(),
                first.line.join(" ")
            ))),
        }
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Option<Duration>,
    ) -> NetlabResult<CommandOutput> {
        let mut line = vec![program.to_string()];
        line.extend(args.iter().map(|a| a.to_string()));
        self.history.lock().push(line.clone());

        {
            let mut expected = self.expected.lock();
            if let Some(pos) = expected.iter().position(|e| e.line == line) {
                if let Some(expectation) = expected.remove(pos) {
                    return expectation.response;
                }
            }
        }

        self.fallback.lock().clone().ok_or_else(|| {
            NetlabError::internal(format!(
                "unexpected command: {}",
                command_line(program, args)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_line() {
        assert_eq!(command_line("ip", &["link", "show"]), "ip link show");
        assert_eq!(command_line("true", &[]), "true");
    }

    #[tokio::test]
    async fn test_mock_answers_each_expectation_once() {
        let executor = MockCommandExecutor::new();
        executor.expect("ovs-vsctl", &["br-exists", "ovs0"], Ok(CommandOutput::ok("")));
        executor.expect(
            "ip",
            &["link", "del", "eth9"],
            Ok(CommandOutput::failed(1, "Cannot find device \"eth9\"\n")),
        );

        // order does not matter
        let del = executor.execute_simple("ip", &["link", "del", "eth9"]).await.unwrap();
        assert_eq!(del.status, 1);
        assert!(!del.success);
        let exists = executor.execute_simple("ovs-vsctl", &["br-exists", "ovs0"]).await.unwrap();
        assert!(exists.success);
        executor.verify().unwrap();

        assert!(executor.execute_simple("ip", &["link", "del", "eth9"]).await.is_err());
        assert_eq!(executor.executed().len(), 3);
        assert_eq!(executor.executed()[1], vec!["ovs-vsctl", "br-exists", "ovs0"]);
    }

    #[tokio::test]
    async fn test_mock_verify_names_pending_command() {
        let executor = MockCommandExecutor::new();
        executor.expect("iptables", &["-vL", "FORWARD"], Ok(CommandOutput::ok("")));
        let err = executor.verify().unwrap_err();
        assert!(err.to_string().contains("iptables -vL FORWARD"));
    }

    #[tokio::test]
    async fn test_mock_fallback_is_shared_by_clones() {
        let executor = MockCommandExecutor::new().with_fallback(CommandOutput::ok("ok"));
        let clone = executor.clone();
        assert_eq!(clone.execute_simple("anything", &[]).await.unwrap().stdout_lossy(), "ok");
        assert_eq!(executor.executed(), vec![vec!["anything".to_string()]]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_executor_reports_exit_code() {
        let executor = TokioCommandExecutor::new();
        let ok = executor.execute_simple("sh", &["-c", "echo up"]).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout_lossy().trim(), "up");

        let failed = executor.execute_simple("sh", &["-c", "echo nope >&2; exit 3"]).await.unwrap();
        assert_eq!(failed.status, 3);
        assert_eq!(failed.stderr_lossy().trim(), "nope");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_executor_times_out() {
        let executor = TokioCommandExecutor::with_timeout(Duration::from_millis(50));
        let err = executor.execute_simple("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, NetlabError::Timeout { .. }));
    }
}
