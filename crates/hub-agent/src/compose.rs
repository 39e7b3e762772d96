//! Builds the launch line handed to the supervisor.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

/// OS-level scope wrapper used to enforce a CPU quota.
pub const CPU_SCOPE_WRAPPER: &str = "systemd-run";

fn env_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9_]+=\S+\s*)+").expect("valid env prefix regex"))
}

/// Splits a leading run of `KEY=value` tokens off `command`.
///
/// Returns `(assignments, rest)`, both trimmed; `assignments` is empty when
/// the command has none.
pub fn split_env_prefix(command: &str) -> (&str, &str) {
    match env_prefix_re().find(command) {
        Some(m) => (m.as_str().trim(), command[m.end()..].trim()),
        None => ("", command),
    }
}

/// Composes the exact string passed to the supervisor's start call.
///
/// With a CPU quota the command runs inside a user scope; inline env
/// assignments stay in front of the wrapper so they land in the process's
/// environment instead of being parsed as wrapper arguments. Without a quota
/// the command is returned unchanged.
pub fn compose_command(command: &str, max_cpu: Option<&str>) -> String {
    let Some(quota) = max_cpu.map(str::trim).filter(|q| !q.is_empty()) else {
        return command.to_string();
    };

    let (env, rest) = split_env_prefix(command.trim_start());
    let wrapped = format!("{CPU_SCOPE_WRAPPER} --user --scope --property=CPUQuota={quota} -- {rest}");
    if env.is_empty() {
        wrapped.trim_end().to_string()
    } else {
        format!("{env} {wrapped}").trim_end().to_string()
    }
}

/// Looks `program` up on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(p)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_tokens_precede_wrapper() {
        let out = compose_command("API_KEY=xyz node server.js", Some("50%"));
        assert_eq!(
            out,
            "API_KEY=xyz systemd-run --user --scope --property=CPUQuota=50% -- node server.js"
        );
    }

    #[test]
    fn multiple_env_tokens_are_kept_in_order() {
        let out = compose_command("PORT=3000 NODE_ENV=production  npm start", Some("25%"));
        assert!(out.starts_with("PORT=3000 NODE_ENV=production systemd-run "));
        assert!(out.ends_with(" -- npm start"));
    }

    #[test]
    fn leading_whitespace_does_not_hide_env_prefix() {
        assert_eq!(
            compose_command("  A=1 node x", Some("50%")),
            "A=1 systemd-run --user --scope --property=CPUQuota=50% -- node x"
        );
    }

    #[test]
    fn wraps_plain_command() {
        assert_eq!(
            compose_command("npm run dev", Some("80%")),
            "systemd-run --user --scope --property=CPUQuota=80% -- npm run dev"
        );
    }

    #[test]
    fn no_quota_passes_through_unchanged() {
        for cmd in [
            "API_KEY=xyz node server.js",
            "  npm start  ",
            "",
            "FOO=1",
            "python -m http.server --bind 0.0.0.0",
        ] {
            assert_eq!(compose_command(cmd, None), cmd);
            assert_eq!(compose_command(cmd, Some("  ")), cmd);
        }
    }

    #[test]
    fn assignment_inside_args_is_not_a_prefix() {
        let (env, rest) = split_env_prefix("node server.js --mode=dev");
        assert_eq!(env, "");
        assert_eq!(rest, "node server.js --mode=dev");
    }

    #[test]
    fn split_detects_prefix() {
        let (env, rest) = split_env_prefix("A=1 B=two ./run.sh");
        assert_eq!(env, "A=1 B=two");
        assert_eq!(rest, "./run.sh");
    }
}
