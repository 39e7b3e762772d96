use clap::{Parser, Subcommand};
use hub_agent::{HubError, TunnelStart};
use hub_process::{ActionOutcome, ProjectView};

use crate::{server, state::AppState};

#[derive(Debug, Parser)]
#[command(
    name = "workspace-hub",
    version,
    about = "Supervise local development projects through pm2"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty projects.json if none exists.
    Init,
    /// Start one project, or every enabled project with --all.
    Start {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Stop one project, or all of them with --all.
    Stop {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    Restart {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Show every project with its live status.
    List,
    Logs {
        name: String,
        #[arg(long, short = 'n')]
        lines: Option<usize>,
    },
    /// Serve the HTTP API and restart alerts.
    Dashboard {
        #[arg(long, env = "DASHBOARD_PORT")]
        port: Option<u16>,
    },
    Tunnel {
        #[command(subcommand)]
        action: TunnelCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum TunnelCommand {
    Start { name: String },
    Stop { name: String },
    List {
        /// Drop records whose process is gone.
        #[arg(long)]
        reconcile: bool,
    },
    /// Store the ngrok auth token.
    Auth { token: String },
}

pub fn format_memory(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn render_table(views: &[ProjectView]) -> String {
    let mut out = format!(
        "{:<24} {:<9} {:>8} {:>7} {:>10} {:>8}  {}\n",
        "NAME", "STATUS", "PID", "CPU", "MEMORY", "RESTARTS", "TUNNEL"
    );
    for v in views {
        let status = serde_json::to_value(v.status)
            .ok()
            .and_then(|s| s.as_str().map(str::to_string))
            .unwrap_or_default();
        let status = if v.project.enabled {
            status
        } else {
            format!("{status}*")
        };
        out.push_str(&format!(
            "{:<24} {:<9} {:>8} {:>6.1}% {:>10} {:>8}  {}\n",
            v.project.name,
            status,
            v.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            v.cpu_percent,
            format_memory(v.memory_bytes),
            v.restart_count,
            v.tunnel_url.as_deref().unwrap_or("-"),
        ));
    }
    out
}

fn print_outcomes(verb: &str, outcomes: &[ActionOutcome]) {
    if outcomes.is_empty() {
        println!("No projects configured");
    }
    for o in outcomes {
        match &o.error {
            None => println!("{verb} {}", o.name),
            Some(err) => eprintln!("{} failed: {err}", o.name),
        }
    }
}

async fn require_config(state: &AppState) -> anyhow::Result<()> {
    let store = state.hub.config();
    if !store.exists().await {
        anyhow::bail!(
            "no config at {}; run `workspace-hub init` first",
            store.path().display()
        );
    }
    Ok(())
}

fn fail_if_any(outcomes: &[ActionOutcome]) -> anyhow::Result<()> {
    let failed = outcomes.iter().filter(|o| !o.ok).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} projects failed", outcomes.len());
    }
    Ok(())
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::from_env()?;
    let hub = &state.hub;

    match cli.command {
        Command::Init => {
            let path = hub.config().path().display().to_string();
            if hub.config().init().await? {
                println!("Created config file: {path}");
                println!("Add projects to it, then run: workspace-hub start --all");
            } else {
                println!("Config already exists at: {path}");
            }
        }
        Command::Start { name, all } => {
            require_config(&state).await?;
            match name {
                Some(name) if !all => {
                    hub.start(&name).await?;
                    println!("Started {name}");
                }
                _ => {
                    let out = hub.start_all().await?;
                    print_outcomes("Started", &out);
                    fail_if_any(&out)?;
                }
            }
        }
        Command::Stop { name, all } => {
            require_config(&state).await?;
            match name {
                Some(name) if !all => {
                    hub.stop(&name).await?;
                    println!("Stopped {name}");
                }
                _ => {
                    let out = hub.stop_all().await?;
                    print_outcomes("Stopped", &out);
                    fail_if_any(&out)?;
                }
            }
        }
        Command::Restart { name, all } => {
            require_config(&state).await?;
            match name {
                Some(name) if !all => {
                    hub.restart(&name).await?;
                    println!("Restarted {name}");
                }
                _ => {
                    let out = hub.restart_all().await?;
                    print_outcomes("Restarted", &out);
                    fail_if_any(&out)?;
                }
            }
        }
        Command::List => {
            require_config(&state).await?;
            print!("{}", render_table(&hub.views().await?));
        }
        Command::Logs { name, lines } => match hub.logs(&name, lines).await? {
            Some(text) => print!("{text}"),
            None => anyhow::bail!("logs for {name} are unavailable"),
        },
        Command::Dashboard { port } => {
            let port = match port {
                Some(p) => p,
                None => hub
                    .config()
                    .load()
                    .await?
                    .settings
                    .dashboard_port
                    .unwrap_or(server::DEFAULT_PORT),
            };
            server::serve(state.clone(), port).await?;
        }
        Command::Tunnel { action } => match action {
            TunnelCommand::Start { name } => match hub.start_tunnel(&name).await? {
                TunnelStart::Started(rec) => println!("{name}: {}", rec.url),
                TunnelStart::AlreadyRunning(rec) => {
                    println!("{name}: {} (already running)", rec.url)
                }
            },
            TunnelCommand::Stop { name } => {
                if hub.stop_tunnel(&name).await? {
                    println!("Stopped tunnel for {name}");
                } else {
                    println!("No tunnel running for {name}");
                }
            }
            TunnelCommand::List { reconcile } => {
                let records = hub.tunnel_records(reconcile).await?;
                if records.is_empty() {
                    println!("No active tunnels");
                }
                for r in records {
                    println!("{:<24} {:>8}  {}", r.name, r.pid, r.url);
                }
            }
            TunnelCommand::Auth { token } => {
                hub.tunnels().configure_auth_token(&token).await?;
                println!("Auth token saved");
            }
        },
    }
    Ok(())
}

/// Exit code for a failed command: 2 for unknown projects, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<HubError>() {
        Some(HubError::NotFound(_)) => 2,
        _ => 1,
    }
}
