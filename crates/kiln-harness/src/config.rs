use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arch::GuestArch;
use crate::error::{HarnessError, Result};

/// Top-level harness configuration (maps to `kiln.toml`).
///
/// The reference behaviour this replaces was a bag of dynamically typed
/// flags; every option here is an explicit, typed field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub vm: VmConfig,
    pub ports: PortRangeConfig,
    pub timeouts: TimeoutConfig,
    pub ssh: SshCredentials,
    pub storage: StorageConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            vm: VmConfig::default(),
            ports: PortRangeConfig::default(),
            timeouts: TimeoutConfig::default(),
            ssh: SshCredentials::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Sanity-check ranges and timeouts before any launch.
    pub fn validate(&self) -> Result<()> {
        if self.ports.low > self.ports.high {
            return Err(HarnessError::Config(format!(
                "invalid port range {}-{}",
                self.ports.low, self.ports.high
            )));
        }
        // Three channels per instance.
        if usize::from(self.ports.high - self.ports.low) + 1 < 3 {
            return Err(HarnessError::Config(
                "port range too small for one instance (need 3 ports)".into(),
            ));
        }
        if self.timeouts.boot_secs == 0 {
            return Err(HarnessError::Config("boot timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Guest VM launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Target guest architecture.
    pub arch: GuestArch,
    /// RAM size in megabytes.
    pub memory_mb: u64,
    /// Extra arguments appended verbatim to the VM command line.
    pub extra_args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            arch: GuestArch::default(),
            memory_mb: 512,
            extra_args: Vec::new(),
        }
    }
}

/// Inclusive TCP port range scanned for the monitor, SSH, and serial channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangeConfig {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            low: 22200,
            high: 22500,
        }
    }
}

/// Timeout and polling knobs, in seconds (loaded as plain integers from TOML).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on the whole boot wait.
    pub boot_secs: u64,
    /// Interval between boot-probe attempts.
    pub boot_poll_millis: u64,
    /// Grace period between the monitor power-down and the hard kill.
    pub shutdown_grace_secs: u64,
    /// SSH connection establishment timeout.
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            boot_secs: 120,
            boot_poll_millis: 2000,
            shutdown_grace_secs: 3,
            connect_secs: 5,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot_secs)
    }

    #[must_use]
    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_millis.max(1))
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

/// Fixed guest credentials used by the remote shell.
///
/// The default is a passwordless root login with host-key verification
/// disabled. That is acceptable ONLY because guests are ephemeral test VMs
/// reachable solely via a loopback port forward; none of this may ever
/// point at a production host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshCredentials {
    /// Guest account to log in as.
    pub user: String,
    /// Guest-side port the host SSH port is forwarded to.
    pub guest_port: u16,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "root".into(),
            guest_port: 22,
        }
    }
}

/// On-disk locations for persisted result sets and per-instance VM logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("test-results"),
            logs_dir: PathBuf::from("vm-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.guest_port, 22);
        assert_eq!(config.timeouts.boot(), Duration::from_secs(120));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut config = HarnessConfig::default();
        config.ports.low = 300;
        config.ports.high = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_too_small_for_three_channels() {
        let mut config = HarnessConfig::default();
        config.ports.low = 10000;
        config.ports.high = 10001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            r#"
[vm]
arch = "aarch64"
memory_mb = 1024

[timeouts]
boot_secs = 60
"#,
        )
        .unwrap();

        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.vm.arch, GuestArch::Aarch64);
        assert_eq!(config.vm.memory_mb, 1024);
        assert_eq!(config.timeouts.boot_secs, 60);
        // Unspecified sections keep their defaults.
        assert_eq!(config.ports.low, PortRangeConfig::default().low);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = HarnessConfig::from_file(Path::new("/nonexistent/kiln.toml")).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
