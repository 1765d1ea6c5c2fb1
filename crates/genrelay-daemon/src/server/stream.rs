//! `GET /stream`: a response's event log as Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use genrelay_core::api::StreamQuery;
use genrelay_core::event::{EventPayload, RelayEvent};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::relay::{GenerationRelay, StreamRejection};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Header a reconnecting `EventSource` sends with the last `id:` it saw.
pub(super) const LAST_EVENT_ID: &str = "last-event-id";

pub(super) async fn stream(
    State(relay): State<Arc<GenerationRelay>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let start_from = start_index(query.start_from, &headers);
    debug!(response_id = %query.id, start_from, epoch = ?query.epoch, "Stream subscription");

    let events = relay.subscribe(&query.id, start_from, query.epoch).await;
    let stream = async_stream::stream! {
        match events {
            Ok(events) => {
                let mut events = std::pin::pin!(events);
                while let Some(event) = events.next().await {
                    yield Ok(to_sse(&event));
                }
            }
            Err(rejection) => yield Ok(rejection_event(rejection)),
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// Later of the query offset and the position after `Last-Event-ID`.
fn start_index(query: Option<u64>, headers: &HeaderMap) -> u64 {
    let from_header = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|id| id.saturating_add(1));
    query.unwrap_or(0).max(from_header.unwrap_or(0))
}

fn to_sse(event: &RelayEvent) -> Event {
    Event::default()
        .event(event.name())
        .id(event.idx.to_string())
        .data(event.sse_data())
}

fn rejection_event(rejection: StreamRejection) -> Event {
    let payload = EventPayload::error(rejection.message());
    Event::default()
        .event(payload.name())
        .data(payload.data().to_string())
}
