use std::collections::BTreeMap;
use std::fmt;

use bollard::models::ContainerInspectResponse;
use chrono::{DateTime, Utc};

/// Docker reports this for containers that never started or never stopped.
const ZERO_TIME_PREFIX: &str = "0001-01-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Read-only view of a container as reported by one inspect call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSnapshot {
    pub name: String,
    pub id: String,
    pub status: String,
    pub running: bool,
    pub image: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
}

fn non_zero_time(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && !v.starts_with(ZERO_TIME_PREFIX))
}

impl ContainerSnapshot {
    pub fn from_inspect(name: &str, info: ContainerInspectResponse) -> Self {
        let state = info.state.unwrap_or_default();

        let port_bindings = info
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|(container_port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| HostBinding {
                        host_ip: b.host_ip.unwrap_or_default(),
                        host_port: b.host_port.unwrap_or_default(),
                    })
                    .collect();
                (container_port, bindings)
            })
            .collect();

        // Prefer the image reference the container was created from over the image id
        let image = info
            .config
            .and_then(|config| config.image)
            .or(info.image)
            .unwrap_or_default();

        Self {
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            id: info.id.unwrap_or_default(),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            running: state.running.unwrap_or(false),
            image,
            started_at: non_zero_time(state.started_at),
            finished_at: non_zero_time(state.finished_at),
            exit_code: state.exit_code,
            pid: state.pid.filter(|pid| *pid > 0),
            port_bindings,
        }
    }

    /// Time since the container last started, if it is running.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if !self.running {
            return None;
        }
        let started = DateTime::parse_from_rfc3339(self.started_at.as_deref()?).ok()?;
        Some(now.signed_duration_since(started.with_timezone(&Utc)))
    }

    /// Plain-text status report served by `GET /health`.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        SnapshotReport {
            snapshot: self,
            now,
        }
        .to_string()
    }
}

struct SnapshotReport<'a> {
    snapshot: &'a ContainerSnapshot,
    now: DateTime<Utc>,
}

impl fmt::Display for SnapshotReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot;
        let short_id = s.id.get(..12).unwrap_or(s.id.as_str());

        writeln!(f, "Container: {}", s.name)?;
        writeln!(f, "ID: {short_id}")?;
        writeln!(f, "Image: {}", s.image)?;
        writeln!(f, "Status: {}", s.status)?;
        writeln!(f, "Running: {}", s.running)?;
        if let Some(started_at) = &s.started_at {
            writeln!(f, "Started At: {started_at}")?;
        }
        if let Some(uptime) = s.uptime(self.now) {
            writeln!(f, "Uptime: {}", format_uptime(uptime))?;
        }
        if let Some(finished_at) = &s.finished_at {
            writeln!(f, "Finished At: {finished_at}")?;
        }
        if let Some(exit_code) = s.exit_code {
            writeln!(f, "Exit Code: {exit_code}")?;
        }
        if let Some(pid) = s.pid {
            writeln!(f, "PID: {pid}")?;
        }

        if s.port_bindings.is_empty() {
            return writeln!(f, "Ports: none");
        }
        writeln!(f, "Ports:")?;
        for (container_port, bindings) in &s.port_bindings {
            if bindings.is_empty() {
                writeln!(f, "  {container_port} (not published)")?;
            }
            for binding in bindings {
                writeln!(
                    f,
                    "  {container_port} -> {}:{}",
                    binding.host_ip, binding.host_port
                )?;
            }
        }
        Ok(())
    }
}

fn format_uptime(uptime: chrono::Duration) -> String {
    let secs = uptime.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
