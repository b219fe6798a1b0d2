use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use uuid::Uuid;

/// Unique instance identifier (short random hex string).
pub type InstanceId = String;

/// Generate a fresh, collision-free instance id.
#[must_use]
pub fn new_instance_id() -> InstanceId {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Lifecycle state of a single test VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Ports allocated, process being spawned.
    Launching,
    /// Process running; guest not yet reachable over SSH.
    Booting,
    /// Guest reachable; scenarios may run.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Process reaped and log closed.
    Stopped,
    /// Launch or boot failed; all resources released. Terminal.
    LaunchFailed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Launching => write!(f, "launching"),
            InstanceState::Booting => write!(f, "booting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::LaunchFailed => write!(f, "launch_failed"),
        }
    }
}

/// The three host-side TCP channels of one instance.
///
/// Each port is independently allocated; no two concurrently running
/// instances ever share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePorts {
    /// VM control channel (power-down commands).
    pub monitor: u16,
    /// Host port forwarded to the guest SSH daemon.
    pub ssh: u16,
    /// TCP-exposed serial console.
    pub serial: u16,
}

impl InstancePorts {
    /// Build from an allocator result; callers guarantee three entries.
    #[must_use]
    pub fn from_allocated(ports: &[u16]) -> Self {
        Self {
            monitor: ports[0],
            ssh: ports[1],
            serial: ports[2],
        }
    }
}

/// One ephemeral VM under test.
///
/// The instance exclusively owns its VM process and log file handle. A live
/// instance (process present) always has three valid bound ports; once the
/// process is gone the instance is terminal and must not be reused.
pub struct Instance {
    /// Unique identifier.
    pub id: InstanceId,
    /// Current lifecycle state (mutated only by the instance manager).
    pub state: InstanceState,
    /// Host-side channel ports.
    pub ports: InstancePorts,
    /// VM process handle. `None` once stopped or failed.
    pub(crate) process: Option<Child>,
    /// Path of the log file capturing the VM's own stdout/stderr.
    pub log_path: PathBuf,
    /// Open log handle; closed (dropped) on teardown.
    pub(crate) log_file: Option<File>,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

impl Instance {
    /// True while the VM process handle is held.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.process.is_some()
    }

    /// Wall-clock time since the process was spawned.
    #[must_use]
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ports", &self.ports)
            .field("live", &self.is_live())
            .field("log_path", &self.log_path)
            .field("started_at", &self.started_at)
            .finish()
    }
}
