//! Call-counting fakes for the oracle and CPU sampler.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hub_process::{ProcessSnapshot, ProcessState};

use crate::{
    cpu::CpuSampler,
    error::{HubError, HubResult},
    oracle::{ProcessOracle, StartSpec},
};

pub(crate) fn running(name: &str, pid: u32, restarts: u32) -> ProcessSnapshot {
    ProcessSnapshot {
        name: name.to_string(),
        status: ProcessState::Running,
        pid: Some(pid),
        cpu_percent: 1.0,
        memory_bytes: 1024,
        uptime_start: Some(1_700_000_000_000),
        restart_count: restarts,
    }
}

#[derive(Default)]
pub(crate) struct FakeOracle {
    pub list_calls: AtomicUsize,
    list: Mutex<Option<Vec<ProcessSnapshot>>>,
    delay: Duration,
    logs: Mutex<Option<String>>,
    log_calls: Mutex<Vec<(String, usize)>>,
    actions: Mutex<Vec<String>>,
    started: Mutex<Vec<StartSpec>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeOracle {
    pub fn with_list(list: Vec<ProcessSnapshot>) -> Self {
        let o = Self::default();
        o.set_list(list);
        o.set_logs("");
        o
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_list(&self, list: Vec<ProcessSnapshot>) {
        *self.list.lock().unwrap() = Some(list);
    }

    pub fn fail_list(&self) {
        *self.list.lock().unwrap() = None;
    }

    pub fn set_logs(&self, text: &str) {
        *self.logs.lock().unwrap() = Some(text.to_string());
    }

    pub fn fail_logs(&self) {
        *self.logs.lock().unwrap() = None;
    }

    /// Makes start/stop/restart fail for `name`.
    pub fn fail_actions_for(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn log_calls(&self) -> Vec<(String, usize)> {
        self.log_calls.lock().unwrap().clone()
    }

    /// `"start api"`, `"stop web"`, ... in call order.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<StartSpec> {
        self.started.lock().unwrap().clone()
    }

    fn act(&self, verb: &str, name: &str) -> HubResult<()> {
        self.actions.lock().unwrap().push(format!("{verb} {name}"));
        if self.failing.lock().unwrap().contains(name) {
            return Err(HubError::OracleFailure(format!(
                "pm2 {verb} exited with exit status: 1: [PM2][ERROR] Process {name} not found"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessOracle for FakeOracle {
    async fn list(&self) -> HubResult<Vec<ProcessSnapshot>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.list
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| HubError::OracleFailure("pm2 daemon not reachable".to_string()))
    }

    async fn start(&self, spec: &StartSpec) -> HubResult<()> {
        self.act("start", &spec.name)?;
        self.started.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn stop(&self, name: &str) -> HubResult<()> {
        self.act("stop", name)
    }

    async fn restart(&self, name: &str) -> HubResult<()> {
        self.act("restart", name)
    }

    async fn logs(&self, name: &str, lines: usize) -> HubResult<String> {
        self.log_calls
            .lock()
            .unwrap()
            .push((name.to_string(), lines));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.logs
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| HubError::OracleFailure("pm2 logs failed".to_string()))
    }
}

#[derive(Default)]
pub(crate) struct FakeSampler {
    pub calls: AtomicUsize,
    values: HashMap<u32, f64>,
    delay: Duration,
    batches: Mutex<Vec<Vec<u32>>>,
    failing: Mutex<bool>,
}

impl FakeSampler {
    pub fn with<const N: usize>(values: [(u32, f64); N]) -> Self {
        Self {
            values: values.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }

    pub fn batches(&self) -> Vec<Vec<u32>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CpuSampler for FakeSampler {
    async fn sample(&self, pids: &[u32]) -> HubResult<HashMap<u32, f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(pids.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if *self.failing.lock().unwrap() {
            return Err(HubError::spawn("ps", "No such file or directory (os error 2)"));
        }
        Ok(pids
            .iter()
            .filter_map(|pid| self.values.get(pid).map(|v| (*pid, *v)))
            .collect())
    }
}
