use std::path::{Path, PathBuf};

use anyhow::Context;
use hub_process::{HubConfig, Project};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::{HubError, HubResult};

/// Loads and persists the project document.
///
/// Reads go to disk every time so hand edits are picked up without a restart.
/// Writes are serialised through one lock and land atomically.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::support::config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    /// A missing document reads as an empty configuration.
    pub async fn load(&self) -> HubResult<HubConfig> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HubConfig::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| HubError::Config(format!("{}: {e}", self.path.display())))
    }

    pub async fn save(&self, config: &HubConfig) -> HubResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(config).await
    }

    async fn write(&self, config: &HubConfig) -> HubResult<()> {
        write_json_atomic(&self.path, config)
            .await
            .map_err(|e| HubError::Config(crate::support::format_error_chain(&e)))
    }

    /// Writes an empty document unless one exists. Returns whether it wrote.
    pub async fn init(&self) -> HubResult<bool> {
        let _guard = self.write_lock.lock().await;
        if self.exists().await {
            return Ok(false);
        }
        self.write(&HubConfig::default()).await?;
        Ok(true)
    }

    pub async fn find(&self, name: &str) -> HubResult<Project> {
        self.load()
            .await?
            .find(name)
            .cloned()
            .ok_or_else(|| HubError::NotFound(name.to_string()))
    }

    pub async fn add_project(&self, project: Project) -> HubResult<Project> {
        validate(&project)?;
        let _guard = self.write_lock.lock().await;
        let mut config = self.load().await?;
        if config.find(&project.name).is_some() {
            return Err(HubError::InvalidProject(format!(
                "project already exists: {}",
                project.name
            )));
        }
        config.projects.push(project.clone());
        self.write(&config).await?;
        tracing::info!(project = %project.name, "project added");
        Ok(project)
    }

    /// Replaces the project called `name`; the replacement may rename it.
    pub async fn edit_project(&self, name: &str, project: Project) -> HubResult<Project> {
        validate(&project)?;
        let _guard = self.write_lock.lock().await;
        let mut config = self.load().await?;
        if project.name != name && config.find(&project.name).is_some() {
            return Err(HubError::InvalidProject(format!(
                "project already exists: {}",
                project.name
            )));
        }
        let slot = config
            .projects
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| HubError::NotFound(name.to_string()))?;
        *slot = project.clone();
        self.write(&config).await?;
        tracing::info!(project = %name, "project updated");
        Ok(project)
    }

    pub async fn remove_project(&self, name: &str) -> HubResult<Project> {
        let _guard = self.write_lock.lock().await;
        let mut config = self.load().await?;
        let idx = config
            .projects
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| HubError::NotFound(name.to_string()))?;
        let removed = config.projects.remove(idx);
        self.write(&config).await?;
        tracing::info!(project = %name, "project removed");
        Ok(removed)
    }
}

fn validate(project: &Project) -> HubResult<()> {
    if project.name.trim().is_empty() {
        return Err(HubError::InvalidProject("name must be non-empty".to_string()));
    }
    if project.name.trim() != project.name {
        return Err(HubError::InvalidProject(
            "name must not have leading or trailing whitespace".to_string(),
        ));
    }
    if project.command.trim().is_empty() {
        return Err(HubError::InvalidProject("command must be non-empty".to_string()));
    }
    Ok(())
}

/// Pretty JSON written to `<path>.tmp`, then renamed over `path`.
pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}
