use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const DEFAULT_LIST_TTL_MS: u64 = 3000;
const DEFAULT_CPU_TTL_MS: u64 = 500;
const DEFAULT_LOG_LINES: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEFAULT_TUNNEL_URL_TIMEOUT_MS: u64 = 30_000;

// Staleness bound of the log tier, as a multiple of the list TTL.
pub(crate) const LOG_STALE_FACTOR: u32 = 5;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn list_ttl() -> Duration {
    Duration::from_millis(
        env_u64("WORKSPACE_HUB_LIST_TTL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_LIST_TTL_MS),
    )
}

pub fn cpu_ttl() -> Duration {
    Duration::from_millis(
        env_u64("WORKSPACE_HUB_CPU_TTL_MS")
            .map(|v| v.clamp(50, 60_000))
            .unwrap_or(DEFAULT_CPU_TTL_MS),
    )
}

pub fn default_log_lines() -> usize {
    env_usize("WORKSPACE_HUB_LOG_LINES")
        .map(|v| v.clamp(10, 10_000))
        .unwrap_or(DEFAULT_LOG_LINES)
}

pub fn poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("WORKSPACE_HUB_POLL_INTERVAL_MS")
            .map(|v| v.clamp(250, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    )
}

pub fn tunnel_url_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WORKSPACE_HUB_TUNNEL_URL_TIMEOUT_MS")
            .map(|v| v.clamp(1000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_TUNNEL_URL_TIMEOUT_MS),
    )
}

pub fn pm2_bin() -> String {
    env_string("WORKSPACE_HUB_PM2_BIN").unwrap_or_else(|| "pm2".to_string())
}

pub fn ngrok_bin() -> String {
    env_string("WORKSPACE_HUB_NGROK_BIN").unwrap_or_else(|| "ngrok".to_string())
}

/// `$WORKSPACE_HUB_CONFIG`, else `~/.workspace-hub`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = env_string("WORKSPACE_HUB_CONFIG") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".workspace-hub")
}

pub fn config_path() -> PathBuf {
    env_string("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("projects.json"))
}

pub fn tunnel_dir() -> PathBuf {
    env_string("WORKSPACE_HUB_TUNNEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("tunnels"))
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Lower-cases and replaces every non-alphanumeric char with `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("pm2 exited with status 1")
            .context("pm2 exited with status 1")
            .context("start api");
        assert_eq!(
            format_error_chain(&err),
            "start api: pm2 exited with status 1"
        );
    }

    #[test]
    fn sanitize_replaces_symbols() {
        assert_eq!(sanitize_name("My App_2.0"), "my-app-2-0");
        assert_eq!(sanitize_name("api"), "api");
    }
}
