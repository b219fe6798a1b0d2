//! VM instance lifecycle management.
//!
//! The manager owns every instance's process handle and log file. Launch
//! allocates ports, spawns the VM binary, and polls the remote shell until
//! the guest answers; teardown sends a power-down over the monitor channel,
//! waits a short grace period, then hard-kills and reaps. Teardown is never
//! cancellable: once stopping starts, resources are released regardless of
//! the surrounding context.

use std::fs::File;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::image::ImageArtifact;
use crate::instance::{Instance, InstancePorts, InstanceState, new_instance_id};
use crate::ports::allocate_distinct;
use crate::shell::RemoteShell;

/// Bound on monitor/serial channel I/O; these are localhost sockets and
/// either answer immediately or not at all.
const CHANNEL_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Manages the lifecycle of ephemeral test VMs.
///
/// Instances are independent: concurrent launches and teardowns are safe,
/// and a failure in one never affects another.
pub struct InstanceManager {
    config: HarnessConfig,
}

impl InstanceManager {
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Remote shell channel for a launched instance.
    #[must_use]
    pub fn shell(&self, instance: &Instance) -> RemoteShell {
        RemoteShell::new(
            instance.ports.ssh,
            &self.config.ssh,
            self.config.timeouts.connect(),
        )
    }

    /// Launch a VM from a built image and wait until the guest is reachable.
    ///
    /// On any failure past port allocation the spawned process is killed and
    /// reaped and the log handle closed; nothing leaks on the error path.
    ///
    /// # Errors
    /// `LaunchFailed` (image missing, spawn failure, early process exit),
    /// `PortExhausted`, `BootTimeout`, or `Cancelled`.
    pub async fn start_instance(
        &self,
        image: &ImageArtifact,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        image.validate()?;

        let id = new_instance_id();
        let allocated = allocate_distinct(self.config.ports.low, self.config.ports.high, 3)?;
        let ports = InstancePorts::from_allocated(&allocated);
        info!(
            instance_id = %id,
            monitor = ports.monitor,
            ssh = ports.ssh,
            serial = ports.serial,
            "launching instance"
        );

        std::fs::create_dir_all(&self.config.storage.logs_dir)?;
        let log_path = self.config.storage.logs_dir.join(format!("{id}.log"));
        let log_file = File::create(&log_path)?;

        let binary = self.config.vm.arch.qemu_binary();
        let args = qemu_args(&self.config, image, ports);
        debug!(instance_id = %id, binary, ?args, "spawning vm process");

        let started_at = Utc::now();
        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file.try_clone()?))
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| HarnessError::LaunchFailed(format!("failed to spawn {binary}: {e}")))?;

        let shell = RemoteShell::new(ports.ssh, &self.config.ssh, self.config.timeouts.connect());
        let boot = wait_for_boot(
            &id,
            &shell,
            &mut child,
            cancel,
            self.config.timeouts.boot(),
            self.config.timeouts.boot_poll_interval(),
        )
        .await;

        if let Err(e) = boot {
            warn!(instance_id = %id, error = %e, "boot failed, releasing resources");
            if let Ok(console) = read_serial(ports.serial, 4096).await {
                debug!(instance_id = %id, console = %console.trim_end(), "serial console tail");
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            drop(log_file);
            return Err(e);
        }

        info!(instance_id = %id, "instance running");
        Ok(Instance {
            id,
            state: InstanceState::Running,
            ports,
            process: Some(child),
            log_path,
            log_file: Some(log_file),
            started_at,
        })
    }

    /// Stop an instance: graceful power-down, grace period, hard kill, reap.
    ///
    /// Idempotent: a missing or already-dead process is not an error, and
    /// the log file is closed no matter which path runs. Deliberately takes
    /// no cancellation token.
    pub async fn stop_instance(&self, instance: &mut Instance) -> Result<()> {
        let Some(mut child) = instance.process.take() else {
            instance.log_file = None;
            if instance.state != InstanceState::LaunchFailed {
                instance.state = InstanceState::Stopped;
            }
            return Ok(());
        };

        instance.state = InstanceState::Stopping;
        info!(instance_id = %instance.id, "stopping instance");

        if let Err(e) = send_powerdown(instance.ports.monitor).await {
            debug!(instance_id = %instance.id, error = %e, "monitor power-down unavailable");
        }

        match tokio::time::timeout(self.config.timeouts.shutdown_grace(), child.wait()).await {
            Ok(Ok(status)) => {
                debug!(instance_id = %instance.id, %status, "guest powered down cleanly");
            }
            Ok(Err(e)) => {
                warn!(instance_id = %instance.id, error = %e, "wait failed, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            Err(_) => {
                debug!(instance_id = %instance.id, "grace period elapsed, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        instance.log_file = None;
        instance.state = InstanceState::Stopped;
        info!(instance_id = %instance.id, "instance stopped");
        Ok(())
    }

    /// Read a bounded chunk from the instance's serial console, for
    /// low-level diagnostics when the remote shell is unavailable.
    pub async fn serial_log(&self, instance: &Instance, max_bytes: usize) -> Result<String> {
        read_serial(instance.ports.serial, max_bytes).await
    }
}

/// Connect to a TCP-exposed serial console and read one bounded chunk.
async fn read_serial(port: u16, max_bytes: usize) -> Result<String> {
    let read = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut buf = vec![0u8; max_bytes];
        let n = stream.read(&mut buf).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).into_owned())
    };
    match tokio::time::timeout(CHANNEL_IO_TIMEOUT, read).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(HarnessError::RemoteConnectionFailed(format!("serial: {e}"))),
        Err(_) => Err(HarnessError::RemoteConnectionFailed(
            "serial: read timed out".into(),
        )),
    }
}

/// Poll the remote shell until the guest answers, the bound elapses, the
/// process dies, or the caller cancels.
async fn wait_for_boot(
    id: &str,
    shell: &RemoteShell,
    child: &mut Child,
    cancel: &CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(HarnessError::Cancelled);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(HarnessError::Cancelled),
            _ = poll.tick() => {}
        }

        if let Some(status) = child.try_wait()? {
            return Err(HarnessError::LaunchFailed(format!(
                "vm process exited during boot: {status}"
            )));
        }

        if shell.probe(cancel).await? {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::BootTimeout {
                id: id.to_string(),
                timeout,
            });
        }
    }
}

/// Send the guest power-down command over the monitor channel.
async fn send_powerdown(port: u16) -> std::io::Result<()> {
    let write = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(b"system_powerdown\n").await?;
        stream.flush().await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::time::timeout(CHANNEL_IO_TIMEOUT, write)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "monitor write timed out"))?
}

/// Build the VM command line for an image and port assignment.
fn qemu_args(config: &HarnessConfig, image: &ImageArtifact, ports: InstancePorts) -> Vec<String> {
    let arch = config.vm.arch;
    let mut args = vec![
        "-machine".to_string(),
        arch.machine_type().to_string(),
        "-cpu".to_string(),
        arch.cpu_type().to_string(),
        "-m".to_string(),
        format!("{}M", config.vm.memory_mb),
        "-kernel".to_string(),
        image.kernel.display().to_string(),
        "-drive".to_string(),
        format!("file={},format=raw,if=virtio", image.rootfs.display()),
        "-append".to_string(),
        format!("{} root=/dev/vda rw", arch.console_boot_args()),
        "-netdev".to_string(),
        format!(
            "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:{}",
            ports.ssh, config.ssh.guest_port
        ),
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
        "-monitor".to_string(),
        format!("tcp:127.0.0.1:{},server,nowait", ports.monitor),
        "-serial".to_string(),
        format!("tcp:127.0.0.1:{},server,nowait", ports.serial),
        "-display".to_string(),
        "none".to_string(),
    ];
    args.extend(config.vm.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GuestArch;
    use std::net::TcpListener;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.storage.logs_dir = dir.join("logs");
        config.storage.results_dir = dir.join("results");
        config.timeouts.shutdown_grace_secs = 0;
        config
    }

    fn test_image(dir: &std::path::Path) -> ImageArtifact {
        let kernel = dir.join("vmlinuz");
        let rootfs = dir.join("rootfs.img");
        std::fs::write(&kernel, b"stub").unwrap();
        std::fs::write(&rootfs, b"stub").unwrap();
        ImageArtifact::new(kernel, rootfs)
    }

    fn sleeper() -> Child {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").kill_on_drop(true);
        cmd.spawn().unwrap()
    }

    fn dead_shell(port: u16) -> RemoteShell {
        RemoteShell::new(
            port,
            &crate::config::SshCredentials::default(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_start_with_missing_image_is_launch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = InstanceManager::new(test_config(dir.path()));
        let image = ImageArtifact::new("/nonexistent/vmlinuz", "/nonexistent/rootfs");
        let err = manager
            .start_instance(&image, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_saturated_port_range_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ports.low = 24910;
        config.ports.high = 24913;
        let _held: Vec<TcpListener> = (24910..=24913)
            .filter_map(|p| TcpListener::bind(("127.0.0.1", p)).ok())
            .collect();

        let manager = InstanceManager::new(config);
        let image = test_image(dir.path());
        let err = manager
            .start_instance(&image, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::PortExhausted { .. }));
        // No VM process was spawned: no log file was even created.
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_boot_wait_pre_cancelled_is_cancelled_not_timeout() {
        let mut child = sleeper();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_boot(
            "t1",
            &dead_shell(1),
            &mut child,
            &cancel,
            Duration::from_secs(120),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());

        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_boot_wait_deadline_is_boot_timeout() {
        let mut child = sleeper();
        let cancel = CancellationToken::new();

        let err = wait_for_boot(
            "t2",
            &dead_shell(1),
            &mut child,
            &cancel,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::BootTimeout { .. }));

        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_boot_wait_detects_early_process_exit() {
        let mut cmd = Command::new("true");
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().unwrap();
        // Give the process time to exit before the first liveness check.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = wait_for_boot(
            "t3",
            &dead_shell(1),
            &mut child,
            &CancellationToken::new(),
            Duration::from_secs(30),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        match err {
            HarnessError::LaunchFailed(msg) => assert!(msg.contains("exited during boot")),
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_without_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = InstanceManager::new(test_config(dir.path()));
        let mut instance = Instance {
            id: "idem0000".to_string(),
            state: InstanceState::Running,
            ports: InstancePorts {
                monitor: 1,
                ssh: 2,
                serial: 3,
            },
            process: None,
            log_path: PathBuf::from("/dev/null"),
            log_file: None,
            started_at: Utc::now(),
        };

        manager.stop_instance(&mut instance).await.unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
        manager.stop_instance(&mut instance).await.unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_kills_live_process_and_closes_log() {
        let dir = tempfile::tempdir().unwrap();
        let manager = InstanceManager::new(test_config(dir.path()));
        let log_path = dir.path().join("stop-test.log");
        let log_file = File::create(&log_path).unwrap();

        let mut instance = Instance {
            id: "kill0000".to_string(),
            state: InstanceState::Running,
            // Unused monitor port: power-down is best-effort and must not
            // block the kill path.
            ports: InstancePorts {
                monitor: 1,
                ssh: 2,
                serial: 3,
            },
            process: Some(sleeper()),
            log_path,
            log_file: Some(log_file),
            started_at: Utc::now(),
        };

        manager.stop_instance(&mut instance).await.unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
        assert!(!instance.is_live());
        assert!(instance.log_file.is_none());

        // Second stop on the already-dead instance is a no-op.
        manager.stop_instance(&mut instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_serial_captures_console_output() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            std::io::Write::write_all(&mut conn, b"[    0.000000] Linux version 6.6\n").unwrap();
        });

        let text = read_serial(port, 4096).await.unwrap();
        assert!(text.contains("Linux version"));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_read_serial_unreachable_is_connection_failure() {
        let err = read_serial(1, 64).await.unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[test]
    fn test_qemu_args_wire_up_all_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.vm.memory_mb = 1024;
        let image = test_image(dir.path());
        let ports = InstancePorts {
            monitor: 4441,
            ssh: 4442,
            serial: 4443,
        };

        let args = qemu_args(&config, &image, ports);
        let joined = args.join(" ");
        assert!(joined.contains("-m 1024M"));
        assert!(joined.contains("hostfwd=tcp:127.0.0.1:4442-:22"));
        assert!(joined.contains("-monitor tcp:127.0.0.1:4441,server,nowait"));
        assert!(joined.contains("-serial tcp:127.0.0.1:4443,server,nowait"));
        assert!(joined.contains("-display none"));
        assert!(joined.contains("-machine q35"));
    }

    #[test]
    fn test_qemu_args_respect_arch_and_extras() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.vm.arch = GuestArch::Aarch64;
        config.vm.extra_args = vec!["-smp".to_string(), "2".to_string()];
        let image = test_image(dir.path());
        let ports = InstancePorts {
            monitor: 1,
            ssh: 2,
            serial: 3,
        };

        let args = qemu_args(&config, &image, ports);
        let joined = args.join(" ");
        assert!(joined.contains("-machine virt"));
        assert!(joined.contains("-cpu cortex-a72"));
        assert!(joined.contains("console=ttyAMA0"));
        assert!(joined.ends_with("-smp 2"));
    }
}
