use clap::Parser;
use hub_control::cli::{self, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = cli::run(cli).await {
        eprintln!("error: {}", hub_agent::support::format_error_chain(&err));
        if let Some(hint) = err
            .downcast_ref::<hub_agent::HubError>()
            .and_then(|e| e.hint())
        {
            eprintln!("hint: {hint}");
        }
        std::process::exit(cli::exit_code(&err));
    }
}
