use std::time::Duration;

use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that can occur while launching, driving, or tearing down test VMs.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// No free TCP port in the configured range.
    #[error("no available port in range {low}-{high}")]
    PortExhausted { low: u16, high: u16 },

    /// The VM process could not be started (or died before boot completed).
    #[error("instance launch failed: {0}")]
    LaunchFailed(String),

    /// The guest never became reachable within the boot bound.
    #[error("instance {id} did not boot within {timeout:?}")]
    BootTimeout { id: String, timeout: Duration },

    /// The caller's cancellation context fired during a wait or execution.
    /// Distinct from a timeout so callers can tell "gave up" from "user aborted".
    #[error("operation cancelled")]
    Cancelled,

    /// The remote shell could not connect to the guest. Used internally to
    /// drive boot polling; never surfaced as a scenario failure.
    #[error("remote shell connection failed: {0}")]
    RemoteConnectionFailed(String),

    /// A remote command exceeded its bound. Output captured before the cut
    /// is preserved for diagnosis.
    #[error("remote command timed out after {timeout:?}")]
    CommandTimeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    /// A remote command returned non-zero, with captured output attached.
    #[error("remote command exited with code {code}")]
    CommandFailed {
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// No prior result set exists for the given instance. Expected and
    /// non-fatal on a first run; comparison is simply skipped.
    #[error("no previous test results found for instance {0}")]
    ResultsNotFound(String),

    /// I/O error (file system, sockets, process spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Result set serialisation/deserialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// True for transient connection failures that the boot probe treats as
    /// "not reachable yet" rather than a hard fault.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::RemoteConnectionFailed(_))
    }

    /// True if this error was caused by caller-side cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
