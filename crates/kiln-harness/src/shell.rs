//! Remote command execution over SSH.
//!
//! The channel drives the OpenSSH client binary rather than speaking the
//! protocol in-process; the harness only ever talks to a loopback port
//! forward, so the client's own connection handling is sufficient. Host-key
//! verification is disabled and a fixed passwordless credential is used;
//! acceptable ONLY for ephemeral, localhost-only test guests.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SshCredentials;
use crate::error::{HarnessError, Result};

/// Exit code the ssh client reserves for its own (connection/protocol)
/// failures, as opposed to the remote command's exit status.
const SSH_CLIENT_ERROR_EXIT: i32 = 255;

/// Timeout for the cheap reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// True if the remote command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into `CommandFailed`, keeping the output.
    pub fn expect_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HarnessError::CommandFailed {
                code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// An authenticated remote-shell channel to one running instance.
///
/// Cheap to clone; holds no connection state. Each `execute` call is an
/// independent session.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    port: u16,
    user: String,
    connect_timeout: Duration,
}

impl RemoteShell {
    #[must_use]
    pub fn new(port: u16, credentials: &SshCredentials, connect_timeout: Duration) -> Self {
        Self {
            port,
            user: credentials.user.clone(),
            connect_timeout,
        }
    }

    /// Host-side SSH port this channel targets.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Execute `command` in the guest with a hard timeout.
    ///
    /// Stdout and stderr are drained concurrently so neither stream can
    /// block the other. On timeout the session is killed and the output
    /// captured so far is preserved in the error. Client-side connection
    /// failures (guest not listening yet) map to `RemoteConnectionFailed`.
    ///
    /// # Errors
    /// `RemoteConnectionFailed`, `CommandTimeout`, `Cancelled`, or `Io` on
    /// spawn failure. A non-zero *guest* exit is not an error here; use
    /// [`CommandOutput::expect_success`] where non-zero means failure.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        trace!(port = self.port, command, "executing remote command");
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@localhost", self.user))
            .arg(command);

        let output = run_with_limits(cmd, timeout, cancel).await?;
        if output.exit_code == SSH_CLIENT_ERROR_EXIT {
            debug!(port = self.port, stderr = %output.stderr.trim(), "ssh connection failed");
            return Err(HarnessError::RemoteConnectionFailed(
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output)
    }

    /// Probe guest reachability by running a no-op command.
    ///
    /// Returns `Ok(true)` when the guest answered, `Ok(false)` while it is
    /// not reachable yet, and `Err(Cancelled)` only on caller cancellation.
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<bool> {
        match self.execute("true", PROBE_TIMEOUT, cancel).await {
            Ok(output) => Ok(output.success()),
            Err(HarnessError::Cancelled) => Err(HarnessError::Cancelled),
            Err(_) => Ok(false),
        }
    }
}

/// How long to let the stream drains flush after the process is gone. A
/// stray descendant holding the pipe open must not stall the caller.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Spawn `cmd` with piped output and race completion against the timeout
/// and the cancellation token. Partial output survives both losses.
pub(crate) async fn run_with_limits(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(HarnessError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    // Independent drains: a full pipe on one stream must never stall the
    // other. Output accumulates in shared buffers so it can be snapshotted
    // even when a drain never reaches end-of-file.
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let (out_buf, out_task) = spawn_drain(stdout);
    let (err_buf, err_task) = spawn_drain(stderr);

    enum Outcome {
        Done(std::process::ExitStatus),
        TimedOut,
        Cancelled,
    }

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Outcome::Cancelled,
        status = child.wait() => Outcome::Done(status?),
        () = tokio::time::sleep(timeout) => Outcome::TimedOut,
    };

    if !matches!(outcome, Outcome::Done(_)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    let _ = tokio::time::timeout(DRAIN_GRACE, out_task).await;
    let _ = tokio::time::timeout(DRAIN_GRACE, err_task).await;
    let stdout = snapshot(&out_buf);
    let stderr = snapshot(&err_buf);

    match outcome {
        Outcome::Done(status) => Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        }),
        Outcome::TimedOut => Err(HarnessError::CommandTimeout {
            timeout,
            stdout,
            stderr,
        }),
        Outcome::Cancelled => Err(HarnessError::Cancelled),
    }
}

type SharedBuf = std::sync::Arc<std::sync::Mutex<Vec<u8>>>;

fn spawn_drain(
    mut reader: impl AsyncReadExt + Unpin + Send + 'static,
) -> (SharedBuf, tokio::task::JoinHandle<()>) {
    let buf: SharedBuf = SharedBuf::default();
    let task_buf = std::sync::Arc::clone(&buf);
    let task = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => task_buf
                    .lock()
                    .expect("drain buffer poisoned")
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (buf, task)
}

fn snapshot(buf: &SharedBuf) -> String {
    String::from_utf8_lossy(&buf.lock().expect("drain buffer poisoned")).into_owned()
}
