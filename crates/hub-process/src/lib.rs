use std::collections::BTreeMap;

use specta::Type;

/// A locally-running development project, keyed by `name` in the supervisor.
///
/// `command` may start with inline `KEY=value` assignments.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub path: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub tunnel: bool,
    /// CPU quota understood by the OS scope wrapper, e.g. `"50%"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<String>,
    /// Supervisor-level memory ceiling, e.g. `"512M"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caddy_config_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_port: Option<u16>,
    // Keys owned by other tools (proxy generator, setup wizard) survive a save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The persisted project document: `{projects: [...], settings: {...}}`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub settings: Settings,
}

impl HubConfig {
    pub fn find(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
    Errored,
    Unknown,
}

impl ProcessState {
    /// Maps a pm2 `pm2_env.status` string.
    pub fn from_supervisor(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" | "launching" => ProcessState::Running,
            "stopped" | "stopping" => ProcessState::Stopped,
            "errored" => ProcessState::Errored,
            _ => ProcessState::Unknown,
        }
    }
}

/// The supervisor's view of one named process. Rebuilt on every query.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub name: String,
    pub status: ProcessState,
    pub pid: Option<u32>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    /// Unix millis at which the current run started.
    pub uptime_start: Option<u64>,
    pub restart_count: u32,
}

impl ProcessSnapshot {
    /// What a configured project looks like when the supervisor does not know it.
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProcessState::Stopped,
            pid: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            uptime_start: None,
            restart_count: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessState::Running
    }
}

/// A configured project merged with its live snapshot, as served to the dashboard.
#[derive(Debug, Clone, serde::Serialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub status: ProcessState,
    pub pid: Option<u32>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub uptime_start: Option<u64>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
}

impl ProjectView {
    pub fn compose(project: Project, snap: ProcessSnapshot, tunnel_url: Option<String>) -> Self {
        Self {
            project,
            status: snap.status,
            pid: snap.pid,
            cpu_percent: snap.cpu_percent,
            memory_bytes: snap.memory_bytes,
            uptime_start: snap.uptime_start,
            restart_count: snap.restart_count,
            tunnel_url,
        }
    }
}

/// Durable marker that a tunnel process should be alive for `name`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub name: String,
    pub url: String,
    pub pid: u32,
    /// Unix millis.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubEvent {
    /// A newly observed crash/restart of a supervised project.
    Restart { name: String, restarts: u32 },
}

/// Per-project result of a batch action.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Type)]
pub struct ActionOutcome {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}
