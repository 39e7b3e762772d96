//! Server-sent stream of restart alerts.

use std::{convert::Infallible, time::Duration};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream};
use hub_process::HubEvent;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};

use crate::state::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Yields each event as JSON data until the bus closes or `shutdown` flips.
pub fn event_stream(
    rx: broadcast::Receiver<HubEvent>,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, shutdown), |(mut rx, mut shutdown)| async move {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let received = tokio::select! {
                r = rx.recv() => r,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            };
            match received {
                Ok(ev) => match Event::default().json_data(&ev) {
                    Ok(event) => return Some((Ok(event), (rx, shutdown))),
                    Err(err) => tracing::warn!(error = %err, "failed to encode event"),
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!("event subscriber connected");
    let stream = event_stream(state.events.subscribe(), state.shutdown.subscribe());
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}
