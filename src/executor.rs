//! Release process supervision.
//!
//! Runs the configured release command as a child process, streams its
//! output into the log, enforces the wall-clock budget with a two-phase
//! SIGTERM/SIGKILL escalation, and durably records the terminal state.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::ledger::SqliteLedger;
use crate::models::ReleaseState;

const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Executor {
    ledger: SqliteLedger,
    release_command: String,
    release_timeout: Duration,
    term_grace: Duration,
}

impl Executor {
    pub fn new(
        ledger: SqliteLedger,
        release_command: String,
        release_timeout: Duration,
        term_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            release_command,
            release_timeout,
            term_grace,
        }
    }

    /// Supervises one release to completion and records its terminal state.
    ///
    /// Never returns before the terminal write has committed: the caller may
    /// release the single-flight permit as soon as this future resolves.
    pub async fn run_release(&self, commit_sha: &str) -> ReleaseState {
        info!(commit_sha, command = %self.release_command, "starting release");
        let outcome = self.supervise(commit_sha).await;
        info!(commit_sha, state = %outcome, "release finished");
        self.record_outcome(commit_sha, outcome).await;
        outcome
    }

    async fn supervise(&self, commit_sha: &str) -> ReleaseState {
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&self.release_command)
            .env("RELEASER_GIT_COMMIT_SHA", commit_sha)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(commit_sha, error = %e, "failed to spawn release command");
                return ReleaseState::Failed;
            }
        };
        stream_child_output(&mut child, commit_sha);

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => ReleaseState::Success,
                Ok(status) => {
                    warn!(commit_sha, code = ?status.code(), "release command exited nonzero");
                    ReleaseState::Failed
                }
                Err(e) => {
                    error!(commit_sha, error = %e, "failed to wait on release command");
                    ReleaseState::Failed
                }
            },
            _ = sleep(self.release_timeout) => {
                warn!(
                    commit_sha,
                    timeout_ms = self.release_timeout.as_millis() as u64,
                    "release exceeded its budget, escalating"
                );
                self.terminate(commit_sha, &mut child).await;
                ReleaseState::Timeout
            }
        }
    }

    /// SIGTERM first; SIGKILL if the process outlives the grace window.
    async fn terminate(&self, commit_sha: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            // Safety: pid comes from a child we spawned and still own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match timeout(self.term_grace, child.wait()).await {
                Ok(_) => {
                    info!(commit_sha, "release stopped on SIGTERM");
                    return;
                }
                Err(_) => {
                    warn!(commit_sha, "release ignored SIGTERM, sending SIGKILL");
                }
            }
        }
        if let Err(e) = child.kill().await {
            error!(commit_sha, error = %e, "failed to kill release command");
        }
    }

    /// Writes the terminal state, retrying forever with capped backoff.
    ///
    /// Losing this write would leave an orphaned `running` row blocking the
    /// queue until a restart, so a transient storage error is never allowed
    /// to drop the outcome.
    async fn record_outcome(&self, commit_sha: &str, state: ReleaseState) {
        let mut backoff = RETRY_BACKOFF_MIN;
        loop {
            match self.ledger.finish(commit_sha, state, Utc::now()) {
                Ok(true) => return,
                Ok(false) => {
                    // Already terminal; the first write wins.
                    warn!(commit_sha, state = %state, "terminal state already recorded");
                    return;
                }
                Err(e) => {
                    error!(commit_sha, error = %e, "failed to record release outcome, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
            }
        }
    }
}

/// Forwards the child's stdout and stderr, line by line, into the log.
fn stream_child_output(child: &mut Child, commit_sha: &str) {
    if let Some(stdout) = child.stdout.take() {
        let sha = commit_sha.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(commit_sha = %sha, "release: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let sha = commit_sha.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(commit_sha = %sha, "release: {}", line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;

    fn temp_ledger(name: &str) -> (SqliteLedger, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "release-gate-exec-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        let ledger = SqliteLedger::open(&path.to_string_lossy()).expect("open ledger");
        (ledger, path)
    }

    fn executor(ledger: SqliteLedger, command: &str, budget: Duration) -> Executor {
        Executor::new(ledger, command.to_string(), budget, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn successful_command_records_success() {
        let (ledger, path) = temp_ledger("success");
        ledger.claim("aaaa111", 0, Utc::now()).unwrap();
        let exec = executor(ledger.clone(), "true", Duration::from_secs(5));
        assert_eq!(exec.run_release("aaaa111").await, ReleaseState::Success);
        let record = ledger.get("aaaa111").unwrap().unwrap();
        assert_eq!(record.state, ReleaseState::Success);
        assert!(record.ended_at.is_some());
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn nonzero_exit_records_failure() {
        let (ledger, path) = temp_ledger("failure");
        ledger.claim("bbbb222", 0, Utc::now()).unwrap();
        let exec = executor(ledger.clone(), "exit 3", Duration::from_secs(5));
        assert_eq!(exec.run_release("bbbb222").await, ReleaseState::Failed);
        assert_eq!(
            ledger.get("bbbb222").unwrap().unwrap().state,
            ReleaseState::Failed
        );
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn unspawnable_command_records_failure() {
        let (ledger, path) = temp_ledger("unspawnable");
        ledger.claim("cccc333", 0, Utc::now()).unwrap();
        let exec = executor(
            ledger.clone(),
            "/nonexistent/release-binary",
            Duration::from_secs(5),
        );
        assert_eq!(exec.run_release("cccc333").await, ReleaseState::Failed);
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn overlong_command_is_killed_and_records_timeout() {
        let (ledger, path) = temp_ledger("timeout");
        ledger.claim("dddd444", 0, Utc::now()).unwrap();
        let exec = executor(ledger.clone(), "sleep 30", Duration::from_millis(100));
        let started = Instant::now();
        assert_eq!(exec.run_release("dddd444").await, ReleaseState::Timeout);
        // budget + grace, with generous slack for CI
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            ledger.get("dddd444").unwrap().unwrap().state,
            ReleaseState::Timeout
        );
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn sigterm_resistant_command_is_sigkilled() {
        let (ledger, path) = temp_ledger("sigkill");
        ledger.claim("eeee555", 0, Utc::now()).unwrap();
        // Trap and ignore SIGTERM so only SIGKILL can end it.
        let exec = executor(
            ledger.clone(),
            "trap '' TERM; sleep 30",
            Duration::from_millis(100),
        );
        let started = Instant::now();
        assert_eq!(exec.run_release("eeee555").await, ReleaseState::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn child_sees_commit_sha_env() {
        let (ledger, path) = temp_ledger("env");
        ledger.claim("ffff666", 0, Utc::now()).unwrap();
        let exec = executor(
            ledger.clone(),
            r#"test "$RELEASER_GIT_COMMIT_SHA" = "ffff666""#,
            Duration::from_secs(5),
        );
        assert_eq!(exec.run_release("ffff666").await, ReleaseState::Success);
        let _ = fs::remove_file(path);
    }
}
