// gateway/sse.rs — events.subscribe bridge.
//
// GET /api/v1/events
//
// Streams the event bus to the client as Server-Sent Events. A client that
// falls more than the per-subscriber queue behind is told it lagged and the
// stream ends — reconnecting gives it a fresh subscription.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::stream;
use tokio::sync::broadcast;

use crate::AppContext;

enum StreamState {
    Open(broadcast::Receiver<crate::events::Event>),
    Closing,
}

pub async fn events(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let rx = ctx.bus.subscribe();

    let stream = stream::unfold(StreamState::Open(rx), |state| async move {
        match state {
            StreamState::Closing => None,
            StreamState::Open(mut rx) => match rx.recv().await {
                Ok(event) => {
                    let sse = SseEvent::default()
                        .event(event.method())
                        .data(event.payload().to_string());
                    Some((Ok::<SseEvent, std::convert::Infallible>(sse), StreamState::Open(rx)))
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Deliver one final notice, then end the stream.
                    let sse = SseEvent::default().event("subscription:lagged").data(
                        serde_json::json!({ "missed": missed, "action": "reconnect" }).to_string(),
                    );
                    Some((Ok(sse), StreamState::Closing))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            },
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
