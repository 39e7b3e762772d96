use std::{collections::HashMap, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{HubError, HubResult};

/// Samples CPU usage for a batch of pids in one external call.
#[async_trait]
pub trait CpuSampler: Send + Sync + 'static {
    async fn sample(&self, pids: &[u32]) -> HubResult<HashMap<u32, f64>>;
}

#[derive(Debug, Clone)]
pub struct PsSampler {
    bin: String,
}

impl Default for PsSampler {
    fn default() -> Self {
        Self {
            bin: "ps".to_string(),
        }
    }
}

#[async_trait]
impl CpuSampler for PsSampler {
    async fn sample(&self, pids: &[u32]) -> HubResult<HashMap<u32, f64>> {
        if pids.is_empty() {
            return Ok(HashMap::new());
        }
        let list = pids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        // ps exits 1 when any pid is gone; the lines it did print are still valid.
        let out = Command::new(&self.bin)
            .args(["-o", "pid=,%cpu=", "-p", &list])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HubError::spawn(&self.bin, e))?;

        Ok(parse_ps_cpu(&String::from_utf8_lossy(&out.stdout)))
    }
}

pub(crate) fn parse_ps_cpu(raw: &str) -> HashMap<u32, f64> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let mut it = line.split_whitespace();
        let (Some(pid), Some(cpu)) = (it.next(), it.next()) else {
            continue;
        };
        let (Ok(pid), Ok(cpu)) = (pid.parse::<u32>(), cpu.parse::<f64>()) else {
            continue;
        };
        if cpu.is_finite() {
            out.insert(pid, cpu.max(0.0));
        }
    }
    out
}
