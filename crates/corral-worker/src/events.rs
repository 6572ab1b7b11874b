//! Rendering backend events as server-sent events, in either dialect.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use corral_core::backend::{BackendEvent, EventStream};
use corral_core::errors::BackendError;
use corral_stream::client::{EVENT_ERROR, EVENT_PLAN_PENDING, EVENT_QUESTION_PENDING, EVENT_SESSION_STARTED};
use corral_stream::{encode_event, WireProtocol};
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// `(event kind, data)` of a native frame.
pub fn native_frame(event: &BackendEvent) -> Option<(&'static str, Value)> {
    match event {
        BackendEvent::SessionStarted { native_session_id } => {
            Some((EVENT_SESSION_STARTED, json!({ "sessionId": native_session_id })))
        }
        BackendEvent::Message(message) => match serde_json::to_value(message) {
            Ok(data) => Some((message.kind(), data)),
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "failed to encode agent message");
                None
            }
        },
        BackendEvent::QuestionPending(payload) => Some((EVENT_QUESTION_PENDING, payload.clone())),
        BackendEvent::PlanPending(payload) => Some((EVENT_PLAN_PENDING, payload.clone())),
    }
}

/// Terminal failure of a turn in the task dialect.
pub fn a2a_failure(task_id: &str, error: &BackendError) -> Value {
    json!({
        "kind": "status-update",
        "taskId": task_id,
        "final": true,
        "status": {
            "state": "failed",
            "message": {"kind": "message", "role": "agent", "parts": [{"kind": "text", "text": error.to_string()}]},
        },
    })
}

#[derive(Clone, Debug)]
pub struct EventEncoder {
    protocol: WireProtocol,
    task_id: String,
}

impl EventEncoder {
    pub fn new(protocol: WireProtocol, task_id: impl Into<String>) -> Self {
        Self { protocol, task_id: task_id.into() }
    }

    /// The worker announces its own id; the inner backend's announcement is
    /// dropped.
    pub fn started(&self) -> Option<Event> {
        self.event(&BackendEvent::SessionStarted { native_session_id: self.task_id.clone() })
    }

    pub fn encode(&self, item: Result<BackendEvent, BackendError>) -> Option<Event> {
        match item {
            Ok(BackendEvent::SessionStarted { .. }) => None,
            Ok(event) => self.event(&event),
            Err(error) => {
                tracing::warn!(task_id = %self.task_id, error = %error, "turn failed on worker");
                Some(match self.protocol {
                    WireProtocol::Native => Event::default()
                        .event(EVENT_ERROR)
                        .data(json!({"error": error.to_string(), "kind": error.error_kind()}).to_string()),
                    WireProtocol::A2a => Event::default().data(a2a_failure(&self.task_id, &error).to_string()),
                })
            }
        }
    }

    fn event(&self, event: &BackendEvent) -> Option<Event> {
        match self.protocol {
            WireProtocol::Native => {
                native_frame(event).map(|(kind, data)| Event::default().event(kind).data(data.to_string()))
            }
            WireProtocol::A2a => encode_event(event, &self.task_id).map(|v| Event::default().data(v.to_string())),
        }
    }
}

/// Stream `events` to the client. Dropping the response (client gone)
/// cancels the turn.
pub fn sse_response(
    encoder: EventEncoder,
    announce: bool,
    events: EventStream,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let first = if announce { encoder.started() } else { None };
    let guard = cancel.drop_guard();
    let body = stream::iter(first)
        .chain(events.filter_map(move |item| futures::future::ready(encoder.encode(item))))
        .map(move |event| {
            let _turn = &guard;
            Ok::<_, Infallible>(event)
        });
    Sse::new(body).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::messages::{AgentMessage, ResultMessage};

    #[test]
    fn native_frames_use_event_kinds() {
        let (kind, data) = native_frame(&BackendEvent::SessionStarted { native_session_id: "w-1".into() }).unwrap();
        assert_eq!(kind, "session-started");
        assert_eq!(data["sessionId"], "w-1");

        let result = BackendEvent::Message(AgentMessage::Result(ResultMessage::success(Some("r1".into()))));
        let (kind, data) = native_frame(&result).unwrap();
        assert_eq!(kind, "result");
        let decoded = AgentMessage::decode(&data.to_string()).unwrap();
        assert!(decoded.is_result());

        let (kind, _) = native_frame(&BackendEvent::PlanPending(json!({"plan": "p"}))).unwrap();
        assert_eq!(kind, "plan-pending");
    }

    #[test]
    fn a2a_failure_is_final() {
        let v = a2a_failure("t1", &BackendError::ConnectionLost("agent exited".into()));
        assert_eq!(v["final"], true);
        assert_eq!(v["status"]["state"], "failed");
        assert!(v["status"]["message"]["parts"][0]["text"].as_str().unwrap().contains("agent exited"));
    }

    #[test]
    fn inner_announcement_is_dropped() {
        let encoder = EventEncoder::new(WireProtocol::Native, "w-1");
        assert!(encoder.encode(Ok(BackendEvent::SessionStarted { native_session_id: "local_x".into() })).is_none());
        assert!(encoder.started().is_some());
        assert!(encoder.encode(Err(BackendError::Runtime("boom".into()))).is_some());
    }
}
