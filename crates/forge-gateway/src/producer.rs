//! Pull-based snapshot sources for poll-driven channels.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};

use forge_registry::ConnectionRegistry;

/// Computes the current value of a poll-driven channel.
///
/// Called from the poll timer; must not block for long.
pub trait SnapshotProducer: Send + Sync {
    fn snapshot(&self) -> Value;
}

impl<F> SnapshotProducer for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn snapshot(&self) -> Value {
        self()
    }
}

/// Uptime below this reports `starting` instead of `healthy`.
const HEALTH_WARMUP: Duration = Duration::from_secs(60);

/// Process health for the `health` channel.
pub struct HealthProducer {
    started: Instant,
    warmup: Duration,
}

impl HealthProducer {
    pub fn new() -> Self {
        Self::since(Instant::now())
    }

    pub fn since(started: Instant) -> Self {
        Self {
            started,
            warmup: HEALTH_WARMUP,
        }
    }
}

impl Default for HealthProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotProducer for HealthProducer {
    fn snapshot(&self) -> Value {
        let uptime = self.started.elapsed();
        let status = if uptime < self.warmup { "starting" } else { "healthy" };
        json!({
            "status": status,
            "uptime": uptime.as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

/// Aggregate registry counters plus open connections, for `diagnostics`.
pub struct RegistryStatusProducer {
    registry: Arc<ConnectionRegistry>,
}

impl RegistryStatusProducer {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl SnapshotProducer for RegistryStatusProducer {
    fn snapshot(&self) -> Value {
        let mut active = self.registry.list_active(None);
        active.sort_by_key(|r| r.connected_at);
        let connections: Vec<Value> = active
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "channel": r.channel,
                    "remoteAddress": r.remote_address,
                    "connectedAt": r.connected_at,
                    "lastActivityAt": r.last_activity_at,
                    "messagesSent": r.messages_sent,
                    "messagesReceived": r.messages_received,
                })
            })
            .collect();
        json!({
            "metrics": self.registry.metrics(),
            "connections": connections,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

/// Nominal link speed used to express throughput as a percentage.
const LINK_BYTES_PER_SEC: f64 = 125_000_000.0; // 1 Gbit/s

#[derive(Default)]
struct Previous {
    at: Option<Instant>,
    cpu: Option<(u64, u64)>,
    disk_io_ms: Option<u64>,
    net_bytes: Option<u64>,
}

/// Host metrics read from `/proc`. Percentages are derived from the delta
/// between consecutive snapshots, so the first reading reports 0 for cpu,
/// disk and network. Hosts without `/proc` report zeros throughout.
pub struct SystemMetricsProducer {
    proc_root: String,
    previous: Mutex<Previous>,
}

impl SystemMetricsProducer {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(proc_root: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: Mutex::new(Previous::default()),
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(format!("{}/{}", self.proc_root, name)).ok()
    }
}

impl Default for SystemMetricsProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotProducer for SystemMetricsProducer {
    fn snapshot(&self) -> Value {
        let now = Instant::now();
        let cpu_now = self.read("stat").as_deref().and_then(parse_cpu);
        let memory = self
            .read("meminfo")
            .as_deref()
            .and_then(parse_memory)
            .unwrap_or(0.0);
        let disk_now = self.read("diskstats").as_deref().map(parse_disk_io_ms);
        let net_now = self.read("net/dev").as_deref().map(parse_net_bytes);

        let mut prev = self.previous.lock().expect("metrics sampler lock poisoned");
        let elapsed = prev.at.map(|t| now.duration_since(t).as_secs_f64());

        let cpu = match (prev.cpu, cpu_now) {
            (Some((idle0, total0)), Some((idle1, total1))) if total1 > total0 => {
                let busy = (total1 - total0).saturating_sub(idle1.saturating_sub(idle0));
                100.0 * busy as f64 / (total1 - total0) as f64
            }
            _ => 0.0,
        };
        let disk = match (prev.disk_io_ms, disk_now, elapsed) {
            (Some(a), Some(b), Some(secs)) if secs > 0.0 => {
                (b.saturating_sub(a) as f64 / (secs * 1000.0) * 100.0).min(100.0)
            }
            _ => 0.0,
        };
        let network = match (prev.net_bytes, net_now, elapsed) {
            (Some(a), Some(b), Some(secs)) if secs > 0.0 => {
                (b.saturating_sub(a) as f64 / secs / LINK_BYTES_PER_SEC * 100.0).min(100.0)
            }
            _ => 0.0,
        };

        *prev = Previous {
            at: Some(now),
            cpu: cpu_now,
            disk_io_ms: disk_now,
            net_bytes: net_now,
        };

        json!({
            "cpu": round1(cpu),
            "memory": round1(memory),
            "disk": round1(disk),
            "network": round1(network),
            "time": Utc::now().to_rfc3339(),
        })
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// `(idle, total)` jiffies from the aggregate `cpu` line.
fn parse_cpu(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

/// Used memory as a percentage of MemTotal.
fn parse_memory(meminfo: &str) -> Option<f64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(100.0 * (total - available) / total)
}

/// Milliseconds spent doing I/O, summed over whole disks (`sdX`, `nvmeXnY`, `vdX`).
fn parse_disk_io_ms(diskstats: &str) -> u64 {
    diskstats
        .lines()
        .filter_map(|l| {
            let fields: Vec<&str> = l.split_whitespace().collect();
            let name = *fields.get(2)?;
            let whole_disk = (name.starts_with("sd") || name.starts_with("vd"))
                && !name.ends_with(|c: char| c.is_ascii_digit())
                || (name.starts_with("nvme") && !name.contains('p'));
            if !whole_disk {
                return None;
            }
            fields.get(12)?.parse::<u64>().ok()
        })
        .sum()
}

/// Received plus transmitted bytes over every interface except loopback.
fn parse_net_bytes(netdev: &str) -> u64 {
    netdev
        .lines()
        .skip(2)
        .filter_map(|l| {
            let (iface, rest) = l.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            Some(fields.first().copied().unwrap_or(0) + fields.get(8).copied().unwrap_or(0))
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::config::RegistryConfig;
    use forge_core::{Channel, ConnectionId};

    #[test]
    fn health_reports_starting_during_warmup() {
        let fresh = HealthProducer::new().snapshot();
        assert_eq!(fresh["status"], "starting");

        let started = Instant::now()
            .checked_sub(Duration::from_secs(61))
            .unwrap_or_else(Instant::now);
        let warm = HealthProducer::since(started).snapshot();
        // Hosts whose monotonic clock is younger than a minute cannot go back that far.
        if started.elapsed() >= HEALTH_WARMUP {
            assert_eq!(warm["status"], "healthy");
        }
    }

    #[test]
    fn registry_status_lists_open_connections() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        registry
            .register(ConnectionId::from("c1"), Channel::Diagnostics, "10.0.0.1", "ua")
            .unwrap();
        let snap = RegistryStatusProducer::new(registry).snapshot();
        assert_eq!(snap["metrics"]["active_connections"], 1);
        assert_eq!(snap["connections"][0]["id"], "c1");
    }

    #[test]
    fn cpu_line_parses() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4\n";
        assert_eq!(parse_cpu(stat), Some((850, 1000)));
    }

    #[test]
    fn memory_percentage() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_memory(meminfo), Some(75.0));
    }

    #[test]
    fn net_bytes_skip_loopback() {
        let netdev = "Inter-|   Receive\n face |bytes packets\n    lo: 500 1 0 0 0 0 0 0 500 1 0 0 0 0 0 0\n  eth0: 1000 5 0 0 0 0 0 0 2000 4 0 0 0 0 0 0\n";
        assert_eq!(parse_net_bytes(netdev), 3000);
    }

    #[test]
    fn metrics_shape_matches_dashboard_payload() {
        let producer = SystemMetricsProducer::with_root("/nonexistent");
        let snap = producer.snapshot();
        for key in ["cpu", "memory", "disk", "network"] {
            assert!(snap[key].is_number(), "{key} missing");
        }
        assert!(snap["time"].is_string());
    }
}
