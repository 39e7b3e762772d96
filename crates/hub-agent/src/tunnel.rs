//! Long-lived tunnel subprocesses, one per project, tracked by on-disk records.
//!
//! A record file under the tunnel directory means "a tunnel process should be
//! alive for this project". It is written once the child prints its public URL
//! and removed when that child exits or is stopped.
//!
//! Children run in their own process group with output appended to
//! `<name>.log` next to the record, so they outlive the process that spawned
//! them.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use hub_process::{ActionOutcome, Project, TunnelRecord};
use regex::Regex;
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{Mutex, oneshot},
};

use crate::{
    config::write_json_atomic,
    error::{HubError, HubResult},
    support::{self, format_error_chain, sanitize_name, unix_ms_now},
};

pub const DEFAULT_URL_PATTERN: &str = r"https://[a-z0-9-]+\.ngrok-free\.app";

const URL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub dir: PathBuf,
    pub program: String,
    /// `{port}` is replaced with the project's port.
    pub args: Vec<String>,
    pub url_pattern: Regex,
    pub url_timeout: Duration,
}

impl TunnelConfig {
    pub fn ngrok(program: impl Into<String>, dir: impl Into<PathBuf>) -> HubResult<Self> {
        Ok(Self {
            dir: dir.into(),
            program: program.into(),
            args: ["http", "{port}", "--log=stdout"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            url_pattern: Regex::new(DEFAULT_URL_PATTERN)
                .map_err(|e| HubError::Config(e.to_string()))?,
            url_timeout: support::tunnel_url_timeout(),
        })
    }

    pub fn from_env() -> HubResult<Self> {
        Self::ngrok(support::ngrok_bin(), support::tunnel_dir())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStart {
    Started(TunnelRecord),
    AlreadyRunning(TunnelRecord),
}

impl TunnelStart {
    pub fn record(&self) -> &TunnelRecord {
        match self {
            TunnelStart::Started(r) | TunnelStart::AlreadyRunning(r) => r,
        }
    }

    pub fn into_record(self) -> TunnelRecord {
        match self {
            TunnelStart::Started(r) | TunnelStart::AlreadyRunning(r) => r,
        }
    }
}

#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: TunnelConfig,
    // Keyed by record file stem, so names that sanitise alike share a lock.
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Kill requests for children this manager spawned, by stem, with their pid.
    kills: std::sync::Mutex<HashMap<String, (u32, oneshot::Sender<()>)>>,
}

impl TunnelManager {
    pub fn new(cfg: TunnelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                locks: std::sync::Mutex::new(HashMap::new()),
                kills: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.cfg.dir
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(sanitize_name(name))
            .or_default()
            .clone()
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.inner.cfg.dir.join(format!("{}.json", sanitize_name(name)))
    }

    /// Output of the tunnel process for `name`, truncated on each start.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.inner.cfg.dir.join(format!("{}.log", sanitize_name(name)))
    }

    async fn read_record(&self, name: &str) -> HubResult<Option<TunnelRecord>> {
        read_record_file(&self.record_path(name)).await
    }

    async fn remove_record(&self, name: &str) -> HubResult<()> {
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn take_kill(&self, name: &str, pid: u32) -> Option<oneshot::Sender<()>> {
        let mut kills = self.inner.kills.lock().unwrap_or_else(|e| e.into_inner());
        let stem = sanitize_name(name);
        match kills.get(&stem) {
            Some((owned, _)) if *owned == pid => kills.remove(&stem).map(|(_, tx)| tx),
            _ => None,
        }
    }

    /// Starts a tunnel for `project` unless a record for it already exists.
    ///
    /// Waits for the child to print its public URL. If none shows up within
    /// the configured bound the child is killed.
    pub async fn start(&self, project: &Project) -> HubResult<TunnelStart> {
        let Some(port) = project.port else {
            return Err(HubError::InvalidProject(format!(
                "{} has no port to tunnel",
                project.name
            )));
        };
        let name = project.name.as_str();
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.read_record(name).await? {
            if existing.name != name {
                return Err(HubError::InvalidProject(format!(
                    "{name} shares its tunnel record with {}",
                    existing.name
                )));
            }
            return Ok(TunnelStart::AlreadyRunning(existing));
        }

        let cfg = &self.inner.cfg;
        tokio::fs::create_dir_all(&cfg.dir).await?;
        let log_path = self.log_path(name);
        let log = tokio::fs::File::create(&log_path).await?.into_std().await;
        let err_log = log.try_clone()?;

        let port = port.to_string();
        let args: Vec<String> = cfg.args.iter().map(|a| a.replace("{port}", &port)).collect();
        let mut child = Command::new(&cfg.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .process_group(0)
            .spawn()
            .map_err(|e| HubError::spawn(&cfg.program, e))?;
        let Some(pid) = child.id() else {
            return Err(HubError::spawn(&cfg.program, "exited immediately"));
        };
        tracing::info!(project = %name, pid, port = %port, log = %log_path.display(), "tunnel process spawned");

        // The waiter owns the child, so only it may signal the pid: once it has
        // reaped the child the pid can belong to anything.
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, mut exit_rx) = oneshot::channel::<()>();
        let waiter = self.clone();
        let waiter_lock = lock.clone();
        let waiter_name = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(project = %waiter_name, pid, error = %err, "failed to kill tunnel process");
                    }
                    child.wait().await
                }
            };
            let _ = exit_tx.send(());
            drop(waiter.take_kill(&waiter_name, pid));
            // Blocks on the project lock, so it cannot observe a half-started tunnel.
            let _guard = waiter_lock.lock().await;
            match waiter.read_record(&waiter_name).await {
                Ok(Some(rec)) if rec.pid == pid => {
                    if let Err(err) = waiter.remove_record(&waiter_name).await {
                        tracing::warn!(project = %waiter_name, error = %err, "failed to remove tunnel record");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(project = %waiter_name, error = %err, "failed to read tunnel record");
                }
            }
            match status {
                Ok(s) => tracing::info!(project = %waiter_name, pid, status = %s, "tunnel process exited"),
                Err(err) => tracing::warn!(project = %waiter_name, pid, error = %err, "tunnel wait failed"),
            }
        });

        let scan = scan_for_url(&log_path, &cfg.url_pattern, &mut exit_rx);
        let url = match tokio::time::timeout(cfg.url_timeout, scan).await {
            Ok(Ok(Some(url))) => url,
            Ok(Ok(None)) => {
                let _ = kill_tx.send(());
                return Err(HubError::spawn(
                    &cfg.program,
                    "exited before reporting a public URL",
                ));
            }
            Ok(Err(err)) => {
                let _ = kill_tx.send(());
                return Err(err.into());
            }
            Err(_) => {
                let _ = kill_tx.send(());
                return Err(HubError::TunnelUrlTimeout {
                    name: name.to_string(),
                    timeout_ms: cfg.url_timeout.as_millis() as u64,
                });
            }
        };

        let record = TunnelRecord {
            name: name.to_string(),
            url,
            pid,
            created_at: unix_ms_now(),
        };
        if let Err(err) = write_json_atomic(&self.record_path(name), &record).await {
            let _ = kill_tx.send(());
            return Err(HubError::Io(std::io::Error::other(format_error_chain(&err))));
        }
        self.inner
            .kills
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sanitize_name(name), (pid, kill_tx));
        tracing::info!(project = %name, url = %record.url, pid, "tunnel up");
        Ok(TunnelStart::Started(record))
    }

    /// Signals the recorded process and deletes the record. Returns whether a
    /// record existed.
    pub async fn stop(&self, name: &str) -> HubResult<bool> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let Some(rec) = self.read_record(name).await? else {
            return Ok(false);
        };
        if rec.name != name {
            return Ok(false);
        }
        // Children spawned elsewhere (another CLI run, an earlier dashboard)
        // can only be reached through the recorded pid.
        let signalled = match self.take_kill(name, rec.pid) {
            Some(tx) => tx.send(()).is_ok(),
            None => terminate(rec.pid),
        };
        if !signalled {
            tracing::debug!(project = %name, pid = rec.pid, "tunnel process already gone");
        }
        self.remove_record(name).await?;
        tracing::info!(project = %name, "tunnel stopped");
        Ok(true)
    }

    pub async fn get(&self, name: &str) -> HubResult<Option<TunnelRecord>> {
        self.read_record(name).await
    }

    /// Every persisted record, sorted by name. Liveness is not checked.
    pub async fn list_active(&self) -> HubResult<Vec<TunnelRecord>> {
        let mut rd = match tokio::fs::read_dir(&self.inner.cfg.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(rec) = read_record_file(&path).await? {
                out.push(rec);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Drops records whose process no longer exists and returns the rest.
    pub async fn reconcile(&self) -> HubResult<Vec<TunnelRecord>> {
        let mut live = Vec::new();
        for rec in self.list_active().await? {
            let lock = self.lock_for(&rec.name);
            let _guard = lock.lock().await;
            let Some(current) = self.read_record(&rec.name).await? else {
                continue;
            };
            if pid_alive(current.pid) {
                live.push(current);
            } else {
                tracing::info!(project = %current.name, pid = current.pid, "dropping stale tunnel record");
                self.remove_record(&current.name).await?;
            }
        }
        Ok(live)
    }

    pub async fn stop_all(&self) -> HubResult<Vec<ActionOutcome>> {
        let mut out = Vec::new();
        for rec in self.list_active().await? {
            out.push(match self.stop(&rec.name).await {
                Ok(_) => ActionOutcome::ok(rec.name),
                Err(err) => ActionOutcome::failed(rec.name, err.to_string()),
            });
        }
        Ok(out)
    }

    /// Starts a tunnel for every enabled project that asks for one and has a port.
    pub async fn start_configured(&self, projects: &[Project]) -> Vec<ActionOutcome> {
        let mut out = Vec::new();
        for p in projects
            .iter()
            .filter(|p| p.enabled && p.tunnel && p.port.is_some())
        {
            out.push(match self.start(p).await {
                Ok(_) => ActionOutcome::ok(&p.name),
                Err(err) => {
                    tracing::warn!(project = %p.name, error = %err, "tunnel start failed");
                    ActionOutcome::failed(&p.name, err.to_string())
                }
            });
        }
        out
    }

    /// Stores the tunnel provider's auth token via its own CLI.
    pub async fn configure_auth_token(&self, token: &str) -> HubResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(HubError::Config("auth token must be non-empty".to_string()));
        }
        let program = &self.inner.cfg.program;
        let out = Command::new(program)
            .args(["config", "add-authtoken", token])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HubError::spawn(program, e))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(HubError::spawn(
                program,
                format!("config add-authtoken exited with {}: {stderr}", out.status),
            ));
        }
        Ok(())
    }
}

async fn read_record_file(path: &Path) -> HubResult<Option<TunnelRecord>> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&data) {
        Ok(rec) => Ok(Some(rec)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable tunnel record");
            Ok(None)
        }
    }
}

/// Reads the tunnel log as it grows until `pattern` matches. Returns `None`
/// when the child exits without printing a match.
async fn scan_for_url(
    path: &Path,
    pattern: &Regex,
    exited: &mut oneshot::Receiver<()>,
) -> std::io::Result<Option<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    let mut done = false;
    loop {
        file.read_to_end(&mut buf).await?;
        if let Some(m) = pattern.find(&String::from_utf8_lossy(&buf)) {
            return Ok(Some(m.as_str().to_string()));
        }
        if done {
            return Ok(None);
        }
        tokio::select! {
            _ = tokio::time::sleep(URL_POLL) => {}
            _ = &mut *exited => done = true,
        }
    }
}

fn as_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and negatives address process groups.
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// SIGTERM to `pid`. Returns false when the signal could not be delivered.
fn terminate(pid: u32) -> bool {
    let Some(pid) = as_pid(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

fn pid_alive(pid: u32) -> bool {
    let Some(pid) = as_pid(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
