//! Layered, independently aged cache over the process oracle.
//!
//! Tiers: the full process list, per-pid CPU samples, and per-project log
//! tails. Each tier has its own TTL; a miss on a tier refreshes only that tier,
//! and concurrent misses on the same key wait for one shared refresh.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use hub_process::ProcessSnapshot;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    cpu::CpuSampler,
    error::HubResult,
    logs::{line_count, strip_ansi, tail_lines},
    oracle::ProcessOracle,
    support,
};

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub list_ttl: Duration,
    pub cpu_ttl: Duration,
    /// Age past which a cached log tail is no longer served.
    pub log_stale_after: Duration,
    /// Tail size kept in the shared log entry.
    pub default_log_lines: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let list_ttl = Duration::from_secs(3);
        Self {
            list_ttl,
            cpu_ttl: Duration::from_millis(500),
            log_stale_after: list_ttl * support::LOG_STALE_FACTOR,
            default_log_lines: 100,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let list_ttl = support::list_ttl();
        Self {
            list_ttl,
            cpu_ttl: support::cpu_ttl(),
            log_stale_after: list_ttl * support::LOG_STALE_FACTOR,
            default_log_lines: support::default_log_lines(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    captured_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            captured_at: Instant::now(),
        }
    }

    fn younger_than(&self, ttl: Duration) -> bool {
        self.captured_at.elapsed() < ttl
    }
}

#[derive(Debug)]
struct ListSlot {
    entry: Option<CacheEntry<Arc<Vec<ProcessSnapshot>>>>,
    // Invalidation generation the entry was captured under.
    generation: u64,
}

#[derive(Debug)]
struct LogTail {
    text: String,
    // Line count the tail was fetched with, not how many lines it holds.
    requested: usize,
}

type LogSlot = Arc<Mutex<Option<CacheEntry<LogTail>>>>;

pub struct SnapshotCache {
    oracle: Arc<dyn ProcessOracle>,
    sampler: Arc<dyn CpuSampler>,
    cfg: CacheConfig,

    list: Mutex<ListSlot>,
    generation: AtomicU64,

    cpu: std::sync::Mutex<HashMap<u32, CacheEntry<f64>>>,
    cpu_refresh: Mutex<()>,

    logs: std::sync::Mutex<HashMap<String, LogSlot>>,
}

impl SnapshotCache {
    pub fn new(
        oracle: Arc<dyn ProcessOracle>,
        sampler: Arc<dyn CpuSampler>,
        cfg: CacheConfig,
    ) -> Self {
        Self {
            oracle,
            sampler,
            cfg,
            list: Mutex::new(ListSlot {
                entry: None,
                generation: 0,
            }),
            generation: AtomicU64::new(0),
            cpu: std::sync::Mutex::new(HashMap::new()),
            cpu_refresh: Mutex::new(()),
            logs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn oracle(&self) -> &Arc<dyn ProcessOracle> {
        &self.oracle
    }

    /// The full process list, refreshed through the oracle once older than
    /// the list TTL or invalidated. A failed refresh serves the previous list,
    /// or an empty one when there is none.
    pub async fn process_list(&self) -> Arc<Vec<ProcessSnapshot>> {
        // Held across the refresh: concurrent misses queue here and then hit.
        let mut slot = self.list.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(entry) = slot.entry.as_ref()
            && slot.generation == generation
            && entry.younger_than(self.cfg.list_ttl)
        {
            return entry.value.clone();
        }

        match self.oracle.list().await {
            Ok(list) => {
                let value = Arc::new(list);
                slot.entry = Some(CacheEntry::new(value.clone()));
                slot.generation = generation;
                value
            }
            Err(err) => {
                tracing::warn!(error = %err, "process list refresh failed; serving last known list");
                slot.entry
                    .as_ref()
                    .map(|e| e.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Forces the next list read to go to the oracle. Never blocks on an
    /// in-flight refresh; a refresh that started before this call is stored
    /// under the old generation and therefore not trusted.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops the shared log tail of one project.
    pub fn forget_logs(&self, name: &str) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Snapshot of one project; `stopped` with zero restarts when the
    /// supervisor does not know it.
    pub async fn status(&self, name: &str) -> ProcessSnapshot {
        self.process_list()
            .await
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .unwrap_or_else(|| ProcessSnapshot::stopped(name))
    }

    /// Snapshots for `names` in order, with running processes' CPU taken from
    /// the CPU tier in a single batch.
    pub async fn snapshots(&self, names: &[&str]) -> Vec<ProcessSnapshot> {
        let list = self.process_list().await;
        let mut snaps: Vec<ProcessSnapshot> = names
            .iter()
            .map(|name| {
                list.iter()
                    .find(|s| s.name == *name)
                    .cloned()
                    .unwrap_or_else(|| ProcessSnapshot::stopped(*name))
            })
            .collect();

        let pids: Vec<u32> = snaps
            .iter()
            .filter(|s| s.is_running())
            .filter_map(|s| s.pid)
            .collect();
        if !pids.is_empty() {
            let cpu = self.cpu_batch(&pids).await;
            for s in snaps.iter_mut() {
                if let Some(v) = s.pid.and_then(|pid| cpu.get(&pid)) {
                    s.cpu_percent = *v;
                }
            }
        }
        snaps
    }

    fn cpu_hits(&self, pids: &[u32], out: &mut HashMap<u32, f64>) -> Vec<u32> {
        let cache = self.cpu.lock().unwrap_or_else(|e| e.into_inner());
        let mut misses = Vec::new();
        for pid in pids {
            if out.contains_key(pid) || misses.contains(pid) {
                continue;
            }
            match cache.get(pid) {
                Some(e) if e.younger_than(self.cfg.cpu_ttl) => {
                    out.insert(*pid, e.value);
                }
                _ => misses.push(*pid),
            }
        }
        misses
    }

    /// CPU percent per pid. Cached samples younger than the CPU TTL are
    /// reused; all misses go to the sampler in one call, in input order. If
    /// sampling fails, every missing pid reads as 0.
    pub async fn cpu_batch(&self, pids: &[u32]) -> HashMap<u32, f64> {
        let mut out = HashMap::with_capacity(pids.len());
        let misses = self.cpu_hits(pids, &mut out);
        if misses.is_empty() {
            return out;
        }

        let _refresh = self.cpu_refresh.lock().await;
        // Another caller may have sampled these while we waited.
        let misses = self.cpu_hits(&misses, &mut out);
        if misses.is_empty() {
            return out;
        }

        match self.sampler.sample(&misses).await {
            Ok(samples) => {
                let max_age = self.cfg.cpu_ttl * 10;
                let mut cache = self.cpu.lock().unwrap_or_else(|e| e.into_inner());
                cache.retain(|_, e| e.younger_than(max_age));
                for pid in misses {
                    let v = samples.get(&pid).copied().unwrap_or(0.0);
                    cache.insert(pid, CacheEntry::new(v));
                    out.insert(pid, v);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, pids = misses.len(), "cpu sampling failed; reporting 0");
                for pid in misses {
                    out.insert(pid, 0.0);
                }
            }
        }
        out
    }

    fn log_slot(&self, name: &str) -> LogSlot {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn fetch_logs(&self, name: &str, lines: usize) -> HubResult<String> {
        let raw = self.oracle.logs(name, lines).await?;
        Ok(tail_lines(&strip_ansi(&raw), lines))
    }

    /// Plain-text log tail of `name`, at most `lines` lines.
    ///
    /// The shared entry holds the default tail size. Requests larger than
    /// that are fetched directly and never replace the shared entry. Returns
    /// `None` when the supervisor could not produce logs.
    pub async fn logs(&self, name: &str, lines: usize) -> Option<String> {
        let lines = lines.max(1);
        let slot = self.log_slot(name);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref()
            && entry.younger_than(self.cfg.log_stale_after)
            && entry.value.requested >= lines
        {
            return Some(tail_lines(&entry.value.text, lines));
        }

        if lines > self.cfg.default_log_lines {
            drop(guard);
            return match self.fetch_logs(name, lines).await {
                Ok(text) => Some(text),
                Err(err) => {
                    tracing::warn!(project = %name, error = %err, "log fetch failed");
                    None
                }
            };
        }

        let requested = self.cfg.default_log_lines;
        match self.fetch_logs(name, requested).await {
            Ok(text) => {
                let out = tail_lines(&text, lines);
                tracing::debug!(project = %name, lines = line_count(&text), "log tail cached");
                *guard = Some(CacheEntry::new(LogTail { text, requested }));
                Some(out)
            }
            Err(err) => {
                tracing::warn!(project = %name, error = %err, "log fetch failed");
                None
            }
        }
    }

    /// Re-reads the list tier every list TTL until `shutdown` flips.
    pub fn spawn_refresher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.cfg.list_ttl;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.process_list().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
