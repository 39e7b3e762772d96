//! Adapter over the external process supervisor (pm2).
//!
//! The supervisor is treated as an opaque command-line oracle: every call
//! spawns it, waits for it, and parses what it printed.

use std::process::Stdio;

use async_trait::async_trait;
use hub_process::{ProcessSnapshot, ProcessState};
use tokio::process::Command;

use crate::error::{HubError, HubResult};

/// Everything the supervisor needs to launch one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    pub name: String,
    /// Already composed; see [`crate::compose::compose_command`].
    pub command: String,
    pub cwd: String,
    pub max_memory: Option<String>,
}

#[async_trait]
pub trait ProcessOracle: Send + Sync + 'static {
    async fn list(&self) -> HubResult<Vec<ProcessSnapshot>>;
    async fn start(&self, spec: &StartSpec) -> HubResult<()>;
    async fn stop(&self, name: &str) -> HubResult<()>;
    async fn restart(&self, name: &str) -> HubResult<()>;
    /// Raw log tail; may contain terminal color sequences.
    async fn logs(&self, name: &str, lines: usize) -> HubResult<String>;
}

#[derive(Debug, Clone)]
pub struct Pm2Oracle {
    bin: String,
}

impl Default for Pm2Oracle {
    fn default() -> Self {
        Self::new(crate::support::pm2_bin())
    }
}

impl Pm2Oracle {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String]) -> HubResult<String> {
        let verb = args.first().map(String::as_str).unwrap_or_default();
        let out = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HubError::spawn(&self.bin, e))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                String::from_utf8_lossy(&out.stdout).trim().to_string()
            } else {
                stderr
            };
            let err = anyhow::anyhow!("exited with {}: {detail}", out.status)
                .context(format!("{} {verb}", self.bin));
            return Err(HubError::oracle(err));
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

pub(crate) fn start_args(spec: &StartSpec) -> Vec<String> {
    let mut args = vec![
        "start".to_string(),
        spec.command.clone(),
        "--name".to_string(),
        spec.name.clone(),
        "--cwd".to_string(),
        spec.cwd.clone(),
        "--no-autorestart".to_string(),
    ];
    if let Some(mem) = spec.max_memory.as_deref().filter(|m| !m.trim().is_empty()) {
        args.push("--max-memory-restart".to_string());
        args.push(mem.trim().to_string());
    }
    args
}

#[async_trait]
impl ProcessOracle for Pm2Oracle {
    async fn list(&self) -> HubResult<Vec<ProcessSnapshot>> {
        let out = self.run(&["jlist".to_string()]).await?;
        parse_jlist(&out)
    }

    async fn start(&self, spec: &StartSpec) -> HubResult<()> {
        self.run(&start_args(spec)).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> HubResult<()> {
        self.run(&["stop".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn restart(&self, name: &str) -> HubResult<()> {
        self.run(&["restart".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn logs(&self, name: &str, lines: usize) -> HubResult<String> {
        self.run(&[
            "logs".to_string(),
            name.to_string(),
            "--lines".to_string(),
            lines.to_string(),
            "--nostream".to_string(),
            "--raw".to_string(),
        ])
        .await
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Pm2Process {
    name: String,
    pid: Option<u32>,
    pm2_env: Pm2Env,
    monit: Pm2Monit,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Pm2Env {
    status: Option<String>,
    pm_uptime: Option<f64>,
    restart_time: Option<u32>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Pm2Monit {
    cpu: Option<f64>,
    memory: Option<u64>,
}

/// Parses `pm2 jlist` output. pm2 sometimes prints warnings before the JSON
/// array, so everything before the first `[` is skipped.
pub fn parse_jlist(raw: &str) -> HubResult<Vec<ProcessSnapshot>> {
    let start = raw
        .find('[')
        .ok_or_else(|| HubError::OracleFailure("pm2 jlist printed no JSON array".to_string()))?;
    let procs: Vec<Pm2Process> = serde_json::from_str(raw[start..].trim_end())
        .map_err(|e| HubError::OracleFailure(format!("malformed pm2 jlist output: {e}")))?;

    let mut out: Vec<ProcessSnapshot> = Vec::with_capacity(procs.len());
    for p in procs {
        if p.name.is_empty() || out.iter().any(|s| s.name == p.name) {
            continue;
        }
        let status = p
            .pm2_env
            .status
            .as_deref()
            .map(ProcessState::from_supervisor)
            .unwrap_or(ProcessState::Unknown);
        out.push(ProcessSnapshot {
            name: p.name,
            status,
            pid: p.pid.filter(|pid| *pid != 0),
            cpu_percent: p.monit.cpu.unwrap_or(0.0),
            memory_bytes: p.monit.memory.unwrap_or(0),
            uptime_start: p
                .pm2_env
                .pm_uptime
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| v as u64),
            restart_count: p.pm2_env.restart_time.unwrap_or(0),
        });
    }
    Ok(out)
}
