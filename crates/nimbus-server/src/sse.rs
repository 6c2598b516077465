//! Server-Sent Events endpoint for live telemetry

use crate::server::SharedState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

pub const EVENT_NAME: &str = "telemetry";

/// SSE handler - one `telemetry` event per ingested sample
pub async fn sse_handler(
    State(app): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Live update subscriber connected");

    let stream = BroadcastStream::new(app.service.subscribe()).filter_map(|message| {
        match message {
            Ok(update) => match serde_json::to_string(&update) {
                Ok(json) => Some(Ok(Event::default().event(EVENT_NAME).data(json))),
                Err(e) => {
                    warn!("Failed to serialize live update: {}", e);
                    None
                }
            },
            Err(lagged) => {
                // Slow subscriber; resume with the newest updates
                warn!("Live update subscriber lagging: {}", lagged);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
