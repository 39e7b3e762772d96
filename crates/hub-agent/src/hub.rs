use std::{collections::HashMap, path::PathBuf, sync::Arc};

use hub_process::{ActionOutcome, HubConfig, ProcessSnapshot, Project, ProjectView, TunnelRecord};

use crate::{
    cache::SnapshotCache,
    compose::{CPU_SCOPE_WRAPPER, compose_command, find_on_path},
    config::ConfigStore,
    error::{HubError, HubResult},
    oracle::StartSpec,
    tunnel::{TunnelManager, TunnelStart},
};

/// User-facing operations over the configured projects.
///
/// Every state-changing call invalidates the process-list tier once the
/// supervisor has answered, whether or not it succeeded.
#[derive(Clone)]
pub struct Hub {
    config: Arc<ConfigStore>,
    cache: Arc<SnapshotCache>,
    tunnels: TunnelManager,
    scope_wrapper: Option<PathBuf>,
}

impl Hub {
    pub fn new(config: Arc<ConfigStore>, cache: Arc<SnapshotCache>, tunnels: TunnelManager) -> Self {
        Self {
            config,
            cache,
            tunnels,
            scope_wrapper: find_on_path(CPU_SCOPE_WRAPPER),
        }
    }

    /// Overrides the resolved CPU scope wrapper; `None` means unavailable.
    pub fn with_scope_wrapper(mut self, wrapper: Option<PathBuf>) -> Self {
        self.scope_wrapper = wrapper;
        self
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    fn settle(&self, name: &str) {
        self.cache.invalidate();
        self.cache.forget_logs(name);
    }

    /// The start request for `project`, composed for the supervisor.
    pub fn start_spec(&self, project: &Project) -> HubResult<StartSpec> {
        let quota = project.max_cpu.as_deref().map(str::trim).filter(|q| !q.is_empty());
        if quota.is_some() && self.scope_wrapper.is_none() {
            return Err(HubError::spawn(
                CPU_SCOPE_WRAPPER,
                format!("not found on PATH; required by maxCpu of {}", project.name),
            ));
        }
        Ok(StartSpec {
            name: project.name.clone(),
            command: compose_command(&project.command, quota),
            cwd: project.path.clone(),
            max_memory: project.max_memory.clone(),
        })
    }

    async fn start_project(&self, project: &Project) -> HubResult<()> {
        let spec = self.start_spec(project)?;
        tracing::info!(project = %project.name, command = %spec.command, "starting project");
        let res = self.cache.oracle().start(&spec).await;
        self.settle(&project.name);
        res
    }

    pub async fn start(&self, name: &str) -> HubResult<()> {
        let project = self.config.find(name).await?;
        self.start_project(&project).await
    }

    pub async fn stop(&self, name: &str) -> HubResult<()> {
        self.config.find(name).await?;
        tracing::info!(project = %name, "stopping project");
        let res = self.cache.oracle().stop(name).await;
        self.settle(name);
        res
    }

    pub async fn restart(&self, name: &str) -> HubResult<()> {
        self.config.find(name).await?;
        tracing::info!(project = %name, "restarting project");
        let res = self.cache.oracle().restart(name).await;
        self.settle(name);
        res
    }

    /// Starts every enabled project, one after another.
    pub async fn start_all(&self) -> HubResult<Vec<ActionOutcome>> {
        let config = self.config.load().await?;
        let mut out = Vec::new();
        for p in config.projects.iter().filter(|p| p.enabled) {
            out.push(outcome(&p.name, self.start_project(p).await));
        }
        Ok(out)
    }

    pub async fn stop_all(&self) -> HubResult<Vec<ActionOutcome>> {
        let config = self.config.load().await?;
        let mut out = Vec::new();
        for p in &config.projects {
            out.push(outcome(&p.name, self.stop(&p.name).await));
        }
        Ok(out)
    }

    pub async fn restart_all(&self) -> HubResult<Vec<ActionOutcome>> {
        let config = self.config.load().await?;
        let mut out = Vec::new();
        for p in &config.projects {
            out.push(outcome(&p.name, self.restart(&p.name).await));
        }
        Ok(out)
    }

    pub async fn status(&self, name: &str) -> HubResult<ProcessSnapshot> {
        self.config.find(name).await?;
        let mut snaps = self.cache.snapshots(&[name]).await;
        Ok(snaps.pop().unwrap_or_else(|| ProcessSnapshot::stopped(name)))
    }

    pub async fn view(&self, name: &str) -> HubResult<ProjectView> {
        let project = self.config.find(name).await?;
        let snap = self.status(name).await?;
        let url = self.tunnels.get(name).await.ok().flatten().map(|r| r.url);
        Ok(ProjectView::compose(project, snap, url))
    }

    /// Every configured project merged with its live state, in config order.
    pub async fn views(&self) -> HubResult<Vec<ProjectView>> {
        let HubConfig { projects, .. } = self.config.load().await?;
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        let snaps = self.cache.snapshots(&names).await;

        let mut urls: HashMap<String, String> = match self.tunnels.list_active().await {
            Ok(records) => records.into_iter().map(|r| (r.name, r.url)).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read tunnel records");
                HashMap::new()
            }
        };

        Ok(projects
            .into_iter()
            .zip(snaps)
            .map(|(p, s)| {
                let url = urls.remove(&p.name);
                ProjectView::compose(p, s, url)
            })
            .collect())
    }

    /// Log tail of `name`; `None` when the supervisor has none to give.
    pub async fn logs(&self, name: &str, lines: Option<usize>) -> HubResult<Option<String>> {
        self.config.find(name).await?;
        let lines = lines.unwrap_or(self.cache.config().default_log_lines);
        Ok(self.cache.logs(name, lines).await)
    }

    pub async fn start_tunnel(&self, name: &str) -> HubResult<TunnelStart> {
        let project = self.config.find(name).await?;
        self.tunnels.start(&project).await
    }

    pub async fn stop_tunnel(&self, name: &str) -> HubResult<bool> {
        self.tunnels.stop(name).await
    }

    pub async fn start_configured_tunnels(&self) -> HubResult<Vec<ActionOutcome>> {
        let config = self.config.load().await?;
        Ok(self.tunnels.start_configured(&config.projects).await)
    }

    pub async fn tunnel_records(&self, reconcile: bool) -> HubResult<Vec<TunnelRecord>> {
        if reconcile {
            self.tunnels.reconcile().await
        } else {
            self.tunnels.list_active().await
        }
    }
}

fn outcome(name: &str, res: HubResult<()>) -> ActionOutcome {
    match res {
        Ok(()) => ActionOutcome::ok(name),
        Err(err) => {
            tracing::warn!(project = %name, error = %err, "batch action failed");
            ActionOutcome::failed(name, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use hub_process::ProcessState;

    use super::*;
    use crate::{
        cache::CacheConfig,
        testing::{FakeOracle, FakeSampler, running},
        tunnel::TunnelConfig,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        oracle: Arc<FakeOracle>,
        hub: Hub,
    }

    fn project(name: &str) -> Project {
        Project {
            name: name.to_string(),
            path: format!("/srv/{name}"),
            command: "PORT=3000 node server.js".to_string(),
            port: Some(3000),
            domain: None,
            tunnel: false,
            max_cpu: None,
            max_memory: None,
            enabled: true,
        }
    }

    async fn fixture(projects: Vec<Project>, list: Vec<ProcessSnapshot>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(dir.path().join("projects.json")));
        for p in projects {
            config.add_project(p).await.unwrap();
        }
        let oracle = Arc::new(FakeOracle::with_list(list));
        let cache = Arc::new(SnapshotCache::new(
            oracle.clone(),
            Arc::new(FakeSampler::with([(10, 42.5)])),
            CacheConfig::default(),
        ));
        let tunnels = TunnelManager::new(TunnelConfig::ngrok("ngrok", dir.path().join("tunnels")).unwrap());
        let hub = Hub::new(config, cache, tunnels)
            .with_scope_wrapper(Some(PathBuf::from("/usr/bin/systemd-run")));
        Fixture {
            _dir: dir,
            oracle,
            hub,
        }
    }

    #[tokio::test]
    async fn start_composes_and_passes_memory_flag() {
        let mut p = project("api");
        p.max_cpu = Some("50%".to_string());
        p.max_memory = Some("512M".to_string());
        let f = fixture(vec![p], vec![]).await;

        f.hub.start("api").await.unwrap();
        let started = f.oracle.started();
        assert_eq!(started.len(), 1);
        assert_eq!(
            started[0].command,
            "PORT=3000 systemd-run --user --scope --property=CPUQuota=50% -- node server.js"
        );
        assert_eq!(started[0].cwd, "/srv/api");
        assert_eq!(started[0].max_memory.as_deref(), Some("512M"));
    }

    #[tokio::test]
    async fn start_without_quota_keeps_command() {
        let f = fixture(vec![project("api")], vec![]).await;
        f.hub.start("api").await.unwrap();
        assert_eq!(f.oracle.started()[0].command, "PORT=3000 node server.js");
    }

    #[tokio::test]
    async fn quota_without_wrapper_fails_before_oracle() {
        let mut p = project("api");
        p.max_cpu = Some("25%".to_string());
        let f = fixture(vec![p], vec![]).await;
        let hub = f.hub.clone().with_scope_wrapper(None);

        let err = hub.start("api").await.unwrap_err();
        assert!(matches!(err, HubError::SpawnFailure { ref program, .. } if program == "systemd-run"));
        assert!(f.oracle.actions().is_empty());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let f = fixture(vec![project("api")], vec![]).await;
        assert!(matches!(f.hub.start("nope").await.unwrap_err(), HubError::NotFound(_)));
        assert!(matches!(f.hub.stop("nope").await.unwrap_err(), HubError::NotFound(_)));
        assert!(matches!(f.hub.logs("nope", None).await.unwrap_err(), HubError::NotFound(_)));
        assert!(f.oracle.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn actions_invalidate_the_list() {
        let f = fixture(vec![project("api")], vec![]).await;
        assert_eq!(f.hub.status("api").await.unwrap().status, ProcessState::Stopped);

        f.oracle.set_list(vec![running("api", 10, 0)]);
        f.hub.start("api").await.unwrap();
        let snap = f.hub.status("api").await.unwrap();
        assert_eq!(snap.status, ProcessState::Running);
        assert_eq!(snap.cpu_percent, 42.5);
        assert_eq!(f.oracle.list_calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(100)).await;
        f.hub.status("api").await.unwrap();
        assert_eq!(f.oracle.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let f = fixture(vec![project("a"), project("b"), project("c")], vec![]).await;
        f.oracle.fail_actions_for("b");

        let out = f.hub.stop_all().await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].ok);
        assert!(!out[1].ok);
        assert!(out[1].error.as_deref().unwrap().contains("not found"));
        assert!(out[2].ok);
        assert_eq!(f.oracle.actions(), vec!["stop a", "stop b", "stop c"]);
    }

    #[tokio::test]
    async fn start_all_skips_disabled() {
        let mut off = project("off");
        off.enabled = false;
        let f = fixture(vec![project("api"), off], vec![]).await;
        let out = f.hub.start_all().await.unwrap();
        assert_eq!(out, vec![ActionOutcome::ok("api")]);
        assert_eq!(f.oracle.actions(), vec!["start api"]);
    }

    #[tokio::test]
    async fn restart_all_covers_every_project() {
        let f = fixture(vec![project("a"), project("b")], vec![]).await;
        let out = f.hub.restart_all().await.unwrap();
        assert!(out.iter().all(|o| o.ok));
        assert_eq!(f.oracle.actions(), vec!["restart a", "restart b"]);
    }

    #[tokio::test]
    async fn views_follow_config_order_and_attach_tunnels() {
        let f = fixture(
            vec![project("web"), project("api")],
            vec![running("api", 10, 3)],
        )
        .await;
        let rec = TunnelRecord {
            name: "api".to_string(),
            url: "https://api-1.ngrok-free.app".to_string(),
            pid: std::process::id(),
            created_at: 1,
        };
        crate::config::write_json_atomic(&f.hub.tunnels().dir().join("api.json"), &rec)
            .await
            .unwrap();

        let views = f.hub.views().await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].project.name, "web");
        assert_eq!(views[0].status, ProcessState::Stopped);
        assert_eq!(views[0].tunnel_url, None);
        assert_eq!(views[1].restart_count, 3);
        assert_eq!(views[1].cpu_percent, 42.5);
        assert_eq!(views[1].tunnel_url.as_deref(), Some("https://api-1.ngrok-free.app"));
    }

    #[tokio::test]
    async fn logs_default_to_configured_tail() {
        let f = fixture(vec![project("api")], vec![]).await;
        f.oracle.set_logs("\x1b[31mboom\x1b[0m\n");
        let text = f.hub.logs("api", None).await.unwrap();
        assert_eq!(text.as_deref(), Some("boom\n"));
        assert_eq!(f.oracle.log_calls(), vec![("api".to_string(), 100)]);
    }
}
