use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use events::EventEnvelope;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::state::AppState;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1000;
pub const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Comma-separated cluster IDs to filter events
    pub cluster_ids: Option<String>,
}

/// Recent envelopes kept for `Last-Event-ID` replay.
pub struct EventBuffer {
    events: VecDeque<EventEnvelope>,
    max_size: usize,
}

impl EventBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, envelope: EventEnvelope) {
        if self.events.len() >= self.max_size {
            self.events.pop_front();
        }
        self.events.push_back(envelope);
    }

    pub fn events_after(&self, event_id: Uuid) -> Vec<EventEnvelope> {
        self.events
            .iter()
            .skip_while(|envelope| envelope.id != event_id)
            .skip(1)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

pub type SharedEventBuffer = Arc<RwLock<EventBuffer>>;

fn parse_cluster_ids(cluster_ids: Option<&str>) -> Option<Vec<String>> {
    cluster_ids.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn wanted(envelope: &EventEnvelope, cluster_ids: Option<&[String]>) -> bool {
    match (cluster_ids, envelope.event.cluster_id()) {
        (Some(ids), Some(cluster_id)) => ids.iter().any(|id| id == cluster_id),
        _ => true,
    }
}

fn event_name(event: &events::Event) -> &'static str {
    match event {
        events::Event::ClusterPhaseChanged { .. } => "cluster.phase_changed",
        events::Event::ClusterDeleted { .. } => "cluster.deleted",
        events::Event::ClusterExposed { .. } => "cluster.exposed",
        events::Event::ClusterUnexposed { .. } => "cluster.unexposed",
        events::Event::NodesAdded { .. } => "nodes.added",
        events::Event::NodesDeleted { .. } => "nodes.deleted",
        events::Event::TaskUpdated { .. } => "task.updated",
        events::Event::Error { .. } => "error",
    }
}

fn envelope_to_sse_event(envelope: &EventEnvelope) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(envelope.id.to_string())
        .event(event_name(&envelope.event))
        .data(data))
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "SSE stream of lifecycle events"),
    ),
    tag = "events"
)]
pub async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cluster_ids = parse_cluster_ids(query.cluster_ids.as_deref());
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Uuid>().ok());

    let buffer = Arc::clone(&state.event_buffer);
    let rx = state.event_bus.subscribe();

    let missed_events: Vec<EventEnvelope> = match last_event_id {
        Some(event_id) => buffer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .events_after(event_id)
            .into_iter()
            .filter(|e| wanted(e, cluster_ids.as_deref()))
            .collect(),
        None => Vec::new(),
    };

    let missed_stream =
        futures::stream::iter(missed_events.into_iter().map(|e| envelope_to_sse_event(&e)));

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| {
        let cluster_ids = cluster_ids.clone();
        let buffer = Arc::clone(&buffer);

        async move {
            match result {
                Ok(envelope) => {
                    buffer
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(envelope.clone());

                    wanted(&envelope, cluster_ids.as_deref())
                        .then(|| envelope_to_sse_event(&envelope))
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "SSE broadcast error");
                    None
                }
            }
        }
    });

    Sse::new(missed_stream.chain(live_stream)).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::Event as LifecycleEvent;

    fn deleted(cluster_id: &str) -> EventEnvelope {
        EventEnvelope::new(LifecycleEvent::ClusterDeleted {
            cluster_id: cluster_id.to_string(),
            cluster_name: "foo".to_string(),
        })
    }

    #[test]
    fn test_parse_cluster_ids() {
        assert!(parse_cluster_ids(None).is_none());
        assert!(parse_cluster_ids(Some("")).unwrap().is_empty());
        assert_eq!(
            parse_cluster_ids(Some("urn:cluster:1 , urn:cluster:2")).unwrap(),
            vec!["urn:cluster:1", "urn:cluster:2"]
        );
    }

    #[test]
    fn test_filter_keeps_events_without_cluster() {
        let ids = vec!["urn:cluster:1".to_string()];
        let error = EventEnvelope::new(LifecycleEvent::Error {
            message: "boom".to_string(),
            context: None,
        });

        assert!(wanted(&deleted("urn:cluster:1"), Some(&ids)));
        assert!(!wanted(&deleted("urn:cluster:2"), Some(&ids)));
        assert!(wanted(&error, Some(&ids)));
        assert!(wanted(&deleted("urn:cluster:2"), None));
    }

    #[test]
    fn test_event_buffer_events_after() {
        let mut buffer = EventBuffer::new(3);
        let e1 = deleted("a");
        let e2 = deleted("b");
        let e3 = deleted("c");
        let (id1, id2, id3) = (e1.id, e2.id, e3.id);

        buffer.push(e1);
        buffer.push(e2);
        buffer.push(e3);

        let after_first = buffer.events_after(id1);
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].id, id2);
        assert_eq!(buffer.events_after(id2)[0].id, id3);
        assert!(buffer.events_after(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_event_buffer_evicts_oldest() {
        let mut buffer = EventBuffer::new(2);
        let e1 = deleted("a");
        let id1 = e1.id;

        buffer.push(e1);
        buffer.push(deleted("b"));
        buffer.push(deleted("c"));

        assert_eq!(buffer.len(), 2);
        assert!(buffer.events_after(id1).is_empty());
    }

    #[test]
    fn test_sse_event_names() {
        let task = LifecycleEvent::TaskUpdated {
            task_id: Uuid::new_v4(),
            cluster_id: None,
            status: "running".to_string(),
            message: "Creating cluster vApp".to_string(),
        };
        assert_eq!(event_name(&task), "task.updated");
        assert_eq!(event_name(&deleted("a").event), "cluster.deleted");
    }
}
