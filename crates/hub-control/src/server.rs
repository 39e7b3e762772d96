use std::net::SocketAddr;

use hub_agent::{ChangeDetector, support};

use crate::{routes, state::AppState};

pub const DEFAULT_PORT: u16 = 9000;

async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    state.begin_shutdown();
}

/// Serves the dashboard API until ctrl-c, with the list refresher and the
/// change detector running alongside.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    match state.hub.tunnels().reconcile().await {
        Ok(live) => tracing::info!(tunnels = live.len(), "tunnel records reconciled"),
        Err(err) => tracing::warn!(error = %err, "tunnel reconciliation failed"),
    }

    let refresher = state
        .hub
        .cache()
        .clone()
        .spawn_refresher(state.shutdown.subscribe());
    let detector = ChangeDetector::new(
        state.hub.cache().clone(),
        state.hub.config().clone(),
        state.events.clone(),
        support::poll_interval(),
    )
    .spawn(state.shutdown.subscribe());

    let app = routes::router(state.clone());
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "workspace-hub dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.begin_shutdown();
    let _ = tokio::join!(refresher, detector);
    Ok(())
}
