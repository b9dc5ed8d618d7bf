//! Event log handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use tracing::debug;

use super::super::types::{EventView, EventsQuery, EventsResponse, StreamQuery};
use super::super::{AppError, SharedState, authenticate};
use crate::constants::{DEFAULT_EVENT_LIMIT, MAX_LIST_LIMIT};
use crate::daemon::services::events::EventQuery;

/// GET /events - Page through the caller's change history, newest first by default.
pub(crate) async fn events_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, AppError> {
    let session = authenticate(&state, &headers).await?;
    let page = state
        .engine
        .events(
            &session,
            EventQuery {
                limit: query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_LIST_LIMIT),
                cursor: query.cursor.filter(|c| !c.is_empty()),
                reverse: query.reverse.unwrap_or(true),
                owner: None,
            },
        )
        .await?;

    Ok(Json(EventsResponse {
        events: page.events.into_iter().map(EventView::from).collect(),
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

/// GET /events/stream - Live change stream as Server-Sent Events.
///
/// The subscription lives inside the stream, so a client disconnect
/// drops it and unregisters the subscriber.
pub(crate) async fn events_stream(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let session = authenticate(&state, &headers).await?;
    let subscription = state.engine.subscribe(&session, query.path.as_deref());
    debug!(owner = %session.owner, filter = ?query.path, "Event stream opened");

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.receiver.recv().await?;
        let event = SseEvent::default()
            .json_data(&message)
            .unwrap_or_else(|_| SseEvent::default().comment("unserializable event"));
        Some((Ok(event), subscription))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
