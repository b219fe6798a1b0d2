//! Best-effort guest resource metrics.
//!
//! Collection issues a handful of diagnostic commands over the remote shell
//! and scrapes their fixed-format text output. Every parse is tolerant: a
//! missing or malformed field leaves the corresponding value at zero, and a
//! collection failure never turns a passing scenario into a failing one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::shell::RemoteShell;

/// Per-command execution bound; metrics must never stall a scenario run.
const METRICS_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// A point-in-time resource snapshot of a guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub cpu_usage_percent: f64,
    pub memory_used_mb: u64,
    pub memory_used_percent: f64,
    pub disk_used_mb: u64,
    pub disk_used_percent: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_received: u64,
    pub load_average_1m: f64,
    pub load_average_5m: f64,
    pub load_average_15m: f64,
}

/// Collect a metrics snapshot from a running instance.
///
/// Returns `None` only when no diagnostic command could be executed at all
/// (guest unreachable); otherwise returns a snapshot whose unparseable
/// fields are zero.
pub async fn collect_system_metrics(
    shell: &RemoteShell,
    cancel: &CancellationToken,
) -> Option<TestMetrics> {
    let mut metrics = TestMetrics::default();
    let mut reachable = false;

    match shell.execute("free -m", METRICS_COMMAND_TIMEOUT, cancel).await {
        Ok(out) => {
            reachable = true;
            if let Some((used, percent)) = parse_free(&out.stdout) {
                metrics.memory_used_mb = used;
                metrics.memory_used_percent = percent;
            }
        }
        Err(e) => debug!(error = %e, "memory metrics unavailable"),
    }

    match shell.execute("df -m /", METRICS_COMMAND_TIMEOUT, cancel).await {
        Ok(out) => {
            reachable = true;
            if let Some((used, percent)) = parse_df(&out.stdout) {
                metrics.disk_used_mb = used;
                metrics.disk_used_percent = percent;
            }
        }
        Err(e) => debug!(error = %e, "disk metrics unavailable"),
    }

    match shell
        .execute("cat /proc/loadavg", METRICS_COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) => {
            reachable = true;
            if let Some((one, five, fifteen)) = parse_loadavg(&out.stdout) {
                metrics.load_average_1m = one;
                metrics.load_average_5m = five;
                metrics.load_average_15m = fifteen;
            }
        }
        Err(e) => debug!(error = %e, "load metrics unavailable"),
    }

    match shell
        .execute("cat /proc/net/dev", METRICS_COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) => {
            reachable = true;
            if let Some((rx, tx)) = parse_net_dev(&out.stdout) {
                metrics.network_bytes_received = rx;
                metrics.network_bytes_sent = tx;
            }
        }
        Err(e) => debug!(error = %e, "network metrics unavailable"),
    }

    match shell
        .execute("top -bn1 | head -n 5", METRICS_COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) => {
            reachable = true;
            if let Some(cpu) = parse_cpu(&out.stdout) {
                metrics.cpu_usage_percent = cpu;
            }
        }
        Err(e) => debug!(error = %e, "cpu metrics unavailable"),
    }

    reachable.then_some(metrics)
}

/// Parse `free -m` output into (used MB, used percent).
fn parse_free(output: &str) -> Option<(u64, f64)> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total: u64 = fields.get(1)?.parse().ok()?;
    let used: u64 = fields.get(2)?.parse().ok()?;
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let percent = used as f64 / total as f64 * 100.0;
    Some((used, percent))
}

/// Parse `df -m /` output into (used MB, use percent).
fn parse_df(output: &str) -> Option<(u64, f64)> {
    // Prefer the row mounted at `/`; fall back to the first data row for
    // df variants that wrap long device names.
    let data_line = output
        .lines()
        .find(|l| l.split_whitespace().next_back() == Some("/"))
        .or_else(|| output.lines().nth(1))?;
    let fields: Vec<&str> = data_line.split_whitespace().collect();
    let used: u64 = fields.get(2)?.parse().ok()?;
    let percent: f64 = fields
        .iter()
        .find(|f| f.ends_with('%'))?
        .trim_end_matches('%')
        .parse()
        .ok()?;
    Some((used, percent))
}

/// Parse `/proc/loadavg` into the 1/5/15-minute averages.
fn parse_loadavg(output: &str) -> Option<(f64, f64, f64)> {
    let mut fields = output.split_whitespace();
    let one: f64 = fields.next()?.parse().ok()?;
    let five: f64 = fields.next()?.parse().ok()?;
    let fifteen: f64 = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

/// Parse `/proc/net/dev` into total (rx bytes, tx bytes) across all
/// non-loopback interfaces.
fn parse_net_dev(output: &str) -> Option<(u64, u64)> {
    let mut rx_total: u64 = 0;
    let mut tx_total: u64 = 0;
    let mut seen = false;

    for line in output.lines() {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        // Layout: rx bytes..packets..(8 fields), then tx bytes at index 8.
        let (Some(rx), Some(tx)) = (fields.first(), fields.get(8)) else {
            continue;
        };
        if let (Ok(rx), Ok(tx)) = (rx.parse::<u64>(), tx.parse::<u64>()) {
            rx_total += rx;
            tx_total += tx;
            seen = true;
        }
    }

    seen.then_some((rx_total, tx_total))
}

/// Parse CPU usage out of `top -bn1` header lines.
///
/// Handles both procps ("%Cpu(s):  1.2 us, ... 97.5 id") and busybox
/// ("CPU:   1% usr   0% sys ...  97% idle") formats, preferring
/// `100 - idle` when an idle figure is present.
fn parse_cpu(output: &str) -> Option<f64> {
    let line = output
        .lines()
        .find(|l| l.contains("Cpu(s)") || l.trim_start().starts_with("CPU:"))?;

    let mut idle: Option<f64> = None;
    let mut busy_sum = 0.0;
    let mut saw_busy = false;

    let tokens: Vec<&str> = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    for pair in tokens.windows(2) {
        let Ok(value) = pair[0].trim_end_matches('%').parse::<f64>() else {
            continue;
        };
        match pair[1] {
            "id" | "idle" => idle = Some(value),
            "us" | "usr" | "sy" | "sys" | "ni" | "nic" | "wa" | "io" => {
                busy_sum += value;
                saw_busy = true;
            }
            _ => {}
        }
    }

    match idle {
        Some(idle) => Some((100.0 - idle).clamp(0.0, 100.0)),
        None if saw_busy => Some(busy_sum.clamp(0.0, 100.0)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_free_procps() {
        let out = "              total        used        free\n\
                   Mem:           1991         123        1562\n\
                   Swap:             0           0           0\n";
        let (used, percent) = parse_free(out).unwrap();
        assert_eq!(used, 123);
        assert!((percent - 6.177).abs() < 0.01);
    }

    #[test]
    fn test_parse_free_garbage_is_none() {
        assert!(parse_free("no memory table here").is_none());
        assert!(parse_free("Mem: zero nonsense").is_none());
    }

    #[test]
    fn test_parse_df_root_row() {
        let out = "Filesystem     1M-blocks  Used Available Use% Mounted on\n\
                   /dev/root           7416  1013      6095  15% /\n";
        let (used, percent) = parse_df(out).unwrap();
        assert_eq!(used, 1013);
        assert!((percent - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_df_missing_fields_is_none() {
        assert!(parse_df("Filesystem Use%\n").is_none());
    }

    #[test]
    fn test_parse_loadavg() {
        let (one, five, fifteen) = parse_loadavg("0.08 0.03 0.05 1/180 4721\n").unwrap();
        assert!((one - 0.08).abs() < f64::EPSILON);
        assert!((five - 0.03).abs() < f64::EPSILON);
        assert!((fifteen - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let out = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo:  999999    100    0    0    0     0          0         0   999999     100    0    0    0     0       0          0\n\
  eth0:    4096     10    0    0    0     0          0         0     2048       8    0    0    0     0       0          0\n";
        let (rx, tx) = parse_net_dev(out).unwrap();
        assert_eq!(rx, 4096);
        assert_eq!(tx, 2048);
    }

    #[test]
    fn test_parse_cpu_procps() {
        let out = "top - 10:00:00 up 1 min\n%Cpu(s):  1.5 us,  1.0 sy,  0.0 ni, 97.5 id,  0.0 wa\n";
        let cpu = parse_cpu(out).unwrap();
        assert!((cpu - 2.5).abs() < 0.01);
    }

    #[test]
    fn test_parse_cpu_busybox() {
        let out = "Mem: 123K used\nCPU:   3% usr   1% sys   0% nic  95% idle   0% io\n";
        let cpu = parse_cpu(out).unwrap();
        assert!((cpu - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_cpu_absent_is_none() {
        assert!(parse_cpu("no cpu line at all\n").is_none());
    }

    #[test]
    fn test_default_snapshot_is_all_zero() {
        let metrics = TestMetrics::default();
        assert_eq!(metrics.memory_used_mb, 0);
        assert_eq!(metrics.network_bytes_sent, 0);
        assert!((metrics.cpu_usage_percent).abs() < f64::EPSILON);
    }
}
