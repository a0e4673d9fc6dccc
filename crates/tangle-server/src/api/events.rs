use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio_stream::StreamExt;

use tangle_core::events::EventKind;
use tangle_core::{AppState, ServerError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type SseStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(event_stream))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated event kinds, e.g. `workflow,step`
    kinds: Option<String>,
}

fn parse_kinds(raw: Option<&str>) -> Result<Option<Vec<EventKind>>, ServerError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| {
            EventKind::from_str(k)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown event kind: {}", k)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// GET /api/events?kinds=workflow,step - SSE stream of engine events.
///
/// Each SSE event is named after the event kind; the data is the tagged
/// event JSON. The stream ends when the notifier closes.
async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<SseStream>, ServerError> {
    let kinds = parse_kinds(query.kinds.as_deref())?;
    let subscription = state.notifier.subscribe_filtered(kinds.as_deref());
    tracing::debug!("[Events] SSE subscriber {} connected", subscription.id());

    let connected = tokio_stream::once(Ok::<_, Infallible>(
        Event::default()
            .event("connected")
            .data(serde_json::json!({ "subscriber_id": subscription.id() }).to_string()),
    ));

    // Heartbeats stop once the notifier closes and the queue drains.
    let events = async_stream::stream! {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            let item = tokio::select! {
                next = subscription.recv() => match next {
                    Some(event) => Event::default()
                        .event(event.kind().as_str())
                        .data(serde_json::to_string(&event).unwrap_or_default()),
                    None => break,
                },
                _ = heartbeat.tick() => Event::default().comment("heartbeat"),
            };
            yield Ok::<_, Infallible>(item);
        }
    };

    let stream: SseStream = Box::pin(connected.chain(events));
    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert!(parse_kinds(None).unwrap().is_none());
        let kinds = parse_kinds(Some("workflow, step")).unwrap().unwrap();
        assert_eq!(kinds, vec![EventKind::Workflow, EventKind::Step]);
        assert!(parse_kinds(Some("workflow,bogus")).is_err());
    }
}
