use thiserror::Error;

use crate::support::format_error_chain;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("project not found: {0}")]
    NotFound(String),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    /// The supervisor ran but failed, or printed something we could not parse.
    #[error("process oracle failed: {0}")]
    OracleFailure(String),

    /// A subprocess could not be launched at all (missing binary, bad cwd).
    #[error("failed to spawn {program}: {message}")]
    SpawnFailure { program: String, message: String },

    #[error("tunnel for {name} did not report a public URL within {timeout_ms}ms")]
    TunnelUrlTimeout { name: String, timeout_ms: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn oracle(err: anyhow::Error) -> Self {
        HubError::OracleFailure(format_error_chain(&err))
    }

    pub fn spawn(program: impl Into<String>, err: impl std::fmt::Display) -> Self {
        HubError::SpawnFailure {
            program: program.into(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "not_found",
            HubError::InvalidProject(_) => "invalid_project",
            HubError::OracleFailure(_) => "oracle_failure",
            HubError::SpawnFailure { .. } => "spawn_failed",
            HubError::TunnelUrlTimeout { .. } => "tunnel_url_timeout",
            HubError::Config(_) => "config_error",
            HubError::Io(_) => "io_error",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            HubError::SpawnFailure { .. } => {
                Some("Ensure the binary is installed and on PATH for the dashboard process.")
            }
            HubError::TunnelUrlTimeout { .. } => {
                Some("Check the tunnel auth token (`workspace-hub tunnel auth <token>`) and network access.")
            }
            HubError::Config(_) => Some("Run `workspace-hub init` or fix the JSON in projects.json."),
            _ => None,
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_error_flattens_chain() {
        let err = anyhow::anyhow!("exit status 1").context("pm2 stop api");
        let e = HubError::oracle(err);
        assert_eq!(e.code(), "oracle_failure");
        assert_eq!(e.to_string(), "process oracle failed: pm2 stop api: exit status 1");
    }

    #[test]
    fn spawn_failure_has_hint() {
        let e = HubError::spawn("ngrok", "No such file or directory (os error 2)");
        assert!(e.hint().is_some());
        assert!(e.to_string().starts_with("failed to spawn ngrok"));
    }
}
