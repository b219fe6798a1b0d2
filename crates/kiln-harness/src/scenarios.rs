//! Built-in test scenarios.
//!
//! Each scenario issues one or more commands over the instance's remote
//! shell and decides pass/fail from the captured output. Timeouts here are
//! per-scenario bounds enforced by the engine; commands carry their own
//! slightly tighter bounds so a wedged guest surfaces as a command timeout
//! with partial output rather than a bare engine cut.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::HarnessError;
use crate::scenario::{Scenario, ScenarioContext, ScenarioFailure, ScenarioOutcome};

/// External address probed by the network scenario.
const PING_TARGET: &str = "8.8.8.8";

/// Marker emitted by the performance workload on completion.
const IO_COMPLETION_MARKER: &str = "io workload complete";

/// Interval between reachability probes during the boot scenario.
const BOOT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Waits until the guest answers on the remote shell.
///
/// The engine's two-minute bound is the failure condition; cancellation and
/// timeout are reported with distinct error text so callers can tell "gave
/// up" from "user aborted".
pub struct BootScenario;

#[async_trait]
impl Scenario for BootScenario {
    fn name(&self) -> &'static str {
        "boot"
    }

    fn description(&self) -> &'static str {
        "guest becomes reachable over the remote shell"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        let started = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            match ctx.shell.probe(&ctx.cancel).await {
                Ok(true) => {
                    return Ok(format!(
                        "reachable after {:?} ({attempts} failed probes)",
                        started.elapsed()
                    ));
                }
                Ok(false) => attempts += 1,
                Err(HarnessError::Cancelled) => {
                    return Err(ScenarioFailure::new(
                        "boot wait cancelled by caller",
                        format!("{attempts} failed probes"),
                    ));
                }
                Err(e) => {
                    return Err(ScenarioFailure::new(
                        format!("boot probe error: {e}"),
                        String::new(),
                    ));
                }
            }
            tokio::time::sleep(BOOT_PROBE_INTERVAL).await;
        }
    }
}

/// ICMP probe to a fixed external address from inside the guest.
pub struct NetworkScenario;

#[async_trait]
impl Scenario for NetworkScenario {
    fn name(&self) -> &'static str {
        "network"
    }

    fn description(&self) -> &'static str {
        "outbound connectivity: all probe packets transmitted and received"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        let command = format!("ping -c 4 -W 5 {PING_TARGET}");
        let output = match ctx
            .shell
            .execute(&command, Duration::from_secs(45), &ctx.cancel)
            .await
        {
            Ok(out) => out,
            Err(e) => return Err(failure_from_error("ping", &e)),
        };

        match parse_ping_counts(&output.stdout) {
            Some((tx, rx)) if tx > 0 && tx == rx => Ok(output.stdout),
            Some((tx, rx)) => Err(ScenarioFailure::new(
                format!("packet loss: {tx} transmitted, {rx} received"),
                output.stdout,
            )),
            None => Err(ScenarioFailure::new(
                "could not parse ping statistics",
                output.stdout,
            )),
        }
    }
}

/// Checks the expected daemons appear in the guest's process list.
pub struct ServicesScenario;

#[async_trait]
impl Scenario for ServicesScenario {
    fn name(&self) -> &'static str {
        "services"
    }

    fn description(&self) -> &'static str {
        "expected system services are running"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        let output = match ctx
            .shell
            .execute("ps aux", Duration::from_secs(20), &ctx.cancel)
            .await
        {
            Ok(out) => out,
            Err(e) => return Err(failure_from_error("ps", &e)),
        };

        if output.stdout.contains("sshd") {
            Ok(output.stdout)
        } else {
            Err(ScenarioFailure::new(
                "sshd not found in process list",
                output.stdout,
            ))
        }
    }
}

/// Fixed-size synthetic I/O workload with a completion marker.
pub struct PerformanceScenario;

#[async_trait]
impl Scenario for PerformanceScenario {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn description(&self) -> &'static str {
        "synthetic disk write workload completes"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        let command = format!(
            "dd if=/dev/zero of=/tmp/kiln-io-test bs=1M count=64 2>&1 && sync && \
             rm -f /tmp/kiln-io-test && echo '{IO_COMPLETION_MARKER}'"
        );
        let output = match ctx
            .shell
            .execute(&command, Duration::from_secs(100), &ctx.cancel)
            .await
        {
            Ok(out) => out,
            Err(e) => return Err(failure_from_error("io workload", &e)),
        };

        if output.stdout.contains(IO_COMPLETION_MARKER) {
            Ok(output.stdout)
        } else {
            Err(ScenarioFailure::new(
                "io workload completion marker missing",
                format!("{}{}", output.stdout, output.stderr),
            ))
        }
    }
}

/// Combined memory/uptime query; both sections must be present.
pub struct StressScenario;

#[async_trait]
impl Scenario for StressScenario {
    fn name(&self) -> &'static str {
        "stress"
    }

    fn description(&self) -> &'static str {
        "guest stays responsive to combined memory and uptime queries"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        let output = match ctx
            .shell
            .execute("free -m; uptime", Duration::from_secs(45), &ctx.cancel)
            .await
        {
            Ok(out) => out,
            Err(e) => return Err(failure_from_error("stress query", &e)),
        };

        let has_memory = output.stdout.contains("Mem");
        let has_uptime = output.stdout.contains("load average");
        if has_memory && has_uptime {
            Ok(output.stdout)
        } else {
            Err(ScenarioFailure::new(
                format!("incomplete stress output (memory: {has_memory}, uptime: {has_uptime})"),
                output.stdout,
            ))
        }
    }
}

/// Map a channel error into a scenario failure, preserving partial output
/// where the error carries any.
fn failure_from_error(what: &str, err: &HarnessError) -> ScenarioFailure {
    match err {
        HarnessError::CommandTimeout { stdout, stderr, .. } => ScenarioFailure::new(
            format!("{what}: {err}"),
            format!("{stdout}{stderr}"),
        ),
        HarnessError::CommandFailed { stdout, stderr, .. } => ScenarioFailure::new(
            format!("{what}: {err}"),
            format!("{stdout}{stderr}"),
        ),
        HarnessError::Cancelled => ScenarioFailure::new(format!("{what} cancelled"), String::new()),
        other => ScenarioFailure::new(format!("{what}: {other}"), String::new()),
    }
}

/// Extract (transmitted, received) packet counts from ping statistics.
///
/// Understands both iputils ("4 packets transmitted, 4 received, 0% packet
/// loss") and busybox ("4 packets transmitted, 4 packets received, 0%
/// packet loss").
fn parse_ping_counts(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().find(|l| l.contains("packets transmitted"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut tx = None;
    let mut rx = None;
    for (i, token) in tokens.iter().enumerate() {
        if token.starts_with("transmitted") {
            // "<n> packets transmitted"
            tx = tokens.get(i.checked_sub(2)?)?.parse().ok();
        } else if token.starts_with("received") {
            // "<n> received" (iputils) or "<n> packets received" (busybox)
            let n = tokens.get(i.checked_sub(1)?)?;
            let n = if *n == "packets" {
                tokens.get(i.checked_sub(2)?)?
            } else {
                n
            };
            rx = n.parse().ok();
        }
    }
    Some((tx?, rx?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping_iputils() {
        let out = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.\n\
                   64 bytes from 8.8.8.8: icmp_seq=1 ttl=115 time=9.8 ms\n\
                   --- 8.8.8.8 ping statistics ---\n\
                   4 packets transmitted, 4 received, 0% packet loss, time 3004ms\n";
        assert_eq!(parse_ping_counts(out), Some((4, 4)));
    }

    #[test]
    fn test_parse_ping_busybox() {
        let out = "--- 8.8.8.8 ping statistics ---\n\
                   4 packets transmitted, 3 packets received, 25% packet loss\n";
        assert_eq!(parse_ping_counts(out), Some((4, 3)));
    }

    #[test]
    fn test_parse_ping_garbage_is_none() {
        assert!(parse_ping_counts("network unreachable\n").is_none());
    }

    #[test]
    fn test_failure_from_timeout_keeps_partial_output() {
        let err = HarnessError::CommandTimeout {
            timeout: Duration::from_secs(5),
            stdout: "so far".into(),
            stderr: String::new(),
        };
        let failure = failure_from_error("ping", &err);
        assert!(failure.message.contains("ping"));
        assert_eq!(failure.output, "so far");
    }

    #[test]
    fn test_builtin_timeouts_are_bounded() {
        assert_eq!(BootScenario.timeout(), Duration::from_secs(120));
        assert!(NetworkScenario.timeout() <= Duration::from_secs(60));
        assert!(ServicesScenario.timeout() <= Duration::from_secs(30));
    }
}
