//! Turns a streamed worker response into [`BackendEvent`]s.

use std::time::Duration;

use bytes::Bytes;
use corral_core::backend::{event_channel, BackendEvent, EventSender, EventStream};
use corral_core::errors::BackendError;
use corral_core::messages::AgentMessage;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sse::{SseDecoder, SseFrame};
use crate::translator::A2aTranslator;

pub const EVENT_SESSION_STARTED: &str = "session-started";
pub const EVENT_QUESTION_PENDING: &str = "question-pending";
pub const EVENT_PLAN_PENDING: &str = "plan-pending";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_RESULT: &str = "result";

/// A single malformed event. Logged and dropped; the stream continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {kind} payload: {source}")]
    Json {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} event missing {field}")]
    MissingField { kind: String, field: &'static str },
}

/// Wire dialect spoken by the remote end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireProtocol {
    /// `event: <kind>` frames carrying agent messages directly.
    #[default]
    Native,
    /// Task/message/status events, translated on the fly.
    A2a,
}

/// Classify one native frame. `Ok(None)` means the frame was consumed
/// without producing an event (e.g. `error`).
pub fn classify_frame(frame: &SseFrame) -> Result<Option<BackendEvent>, ProtocolError> {
    let json = |kind: &str| -> Result<Value, ProtocolError> {
        serde_json::from_str(&frame.data).map_err(|source| ProtocolError::Json { kind: kind.to_string(), source })
    };
    match frame.event.as_str() {
        EVENT_SESSION_STARTED => {
            let v = json(EVENT_SESSION_STARTED)?;
            let id = v
                .get("sessionId")
                .or_else(|| v.get("session_id"))
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField { kind: EVENT_SESSION_STARTED.into(), field: "sessionId" })?;
            Ok(Some(BackendEvent::SessionStarted { native_session_id: id.to_string() }))
        }
        EVENT_QUESTION_PENDING => Ok(Some(BackendEvent::QuestionPending(json(EVENT_QUESTION_PENDING)?))),
        EVENT_PLAN_PENDING => Ok(Some(BackendEvent::PlanPending(json(EVENT_PLAN_PENDING)?))),
        EVENT_ERROR => {
            let message = serde_json::from_str::<Value>(&frame.data)
                .ok()
                .and_then(|v| v.get("error").or_else(|| v.get("message")).and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| frame.data.clone());
            tracing::warn!(error = %message, "worker reported error event");
            Ok(None)
        }
        kind => AgentMessage::decode(&frame.data)
            .map(|m| Some(BackendEvent::Message(m)))
            .map_err(|source| ProtocolError::Json {
                kind: if kind.is_empty() { "message".into() } else { kind.to_string() },
                source,
            }),
    }
}

/// Options for [`pump_events`].
#[derive(Clone, Debug)]
pub struct PumpOptions {
    pub protocol: WireProtocol,
    /// Fail with `ConnectionLost` when no bytes arrive for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self { protocol: WireProtocol::Native, idle_timeout: None }
    }
}

/// Read `body` to completion, forwarding events into `tx`.
///
/// Stops quietly on cancellation or when the consumer goes away. A body
/// that ends (or errors) before a `result` message is reported as
/// [`BackendError::ConnectionLost`].
pub async fn pump_events<S, E>(body: S, tx: EventSender, cancel: CancellationToken, opts: PumpOptions)
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();
    let mut translator = A2aTranslator::new();
    let idle = opts.idle_timeout.unwrap_or(Duration::MAX);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("event stream cancelled");
                return;
            }
            next = tokio::time::timeout(idle, body.next()) => next,
        };
        let chunk = match next {
            Err(_) => {
                let _ = tx.send(Err(BackendError::ConnectionLost(format!(
                    "no data for {}s",
                    idle.as_secs()
                ))));
                return;
            }
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(BackendError::ConnectionLost(e.to_string())));
                return;
            }
            Ok(None) => break,
        };
        for frame in decoder.push_bytes(&chunk) {
            match forward(&frame, &mut translator, opts.protocol, &tx) {
                Forward::Continue => {}
                Forward::Done => return,
            }
        }
    }

    if let Some(frame) = decoder.finish() {
        if let Forward::Done = forward(&frame, &mut translator, opts.protocol, &tx) {
            return;
        }
    }
    let _ = tx.send(Err(BackendError::ConnectionLost("stream ended before result".into())));
}

enum Forward {
    Continue,
    /// Terminal result delivered or consumer gone.
    Done,
}

fn forward(frame: &SseFrame, translator: &mut A2aTranslator, protocol: WireProtocol, tx: &EventSender) -> Forward {
    let events = match protocol {
        WireProtocol::Native => match classify_frame(frame) {
            Ok(event) => event.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed event");
                Vec::new()
            }
        },
        WireProtocol::A2a => match translator.translate_frame(&frame.data) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed event");
                Vec::new()
            }
        },
    };
    for event in events {
        let terminal = matches!(&event, BackendEvent::Message(m) if m.is_result());
        if tx.send(Ok(event)).is_err() {
            return Forward::Done;
        }
        if terminal {
            return Forward::Done;
        }
    }
    Forward::Continue
}

/// Spawn [`pump_events`] as its own task and return the consumer side.
pub fn spawn_event_stream<S, E>(body: S, cancel: CancellationToken, opts: PumpOptions) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, stream) = event_channel();
    tokio::spawn(pump_events(body, tx, cancel, opts));
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static {
        let owned: Vec<Result<Bytes, String>> = parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect();
        futures::stream::iter(owned)
    }

    async fn collect(mut stream: EventStream) -> Vec<Result<BackendEvent, BackendError>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    const STARTED: &str = "event: session-started\ndata: {\"sessionId\":\"w-1\"}\n\n";
    const RESULT: &str = "event: result\ndata: {\"type\":\"result\",\"subtype\":\"success\",\"total_cost_usd\":0.1}\n\n";

    #[test]
    fn classify_control_events() {
        let started = classify_frame(&SseFrame { event: "session-started".into(), data: "{\"session_id\":\"n\"}".into() })
            .unwrap()
            .unwrap();
        assert!(matches!(started, BackendEvent::SessionStarted { native_session_id } if native_session_id == "n"));

        let q = classify_frame(&SseFrame { event: "question-pending".into(), data: "{\"questions\":[]}".into() }).unwrap();
        assert!(matches!(q, Some(BackendEvent::QuestionPending(_))));

        let err = classify_frame(&SseFrame { event: "error".into(), data: "{\"error\":\"boom\"}".into() }).unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn classify_rejects_bad_payloads() {
        let missing = classify_frame(&SseFrame { event: "session-started".into(), data: "{}".into() });
        assert!(matches!(missing, Err(ProtocolError::MissingField { .. })));
        let bad = classify_frame(&SseFrame { event: "assistant".into(), data: "{not json".into() });
        assert!(matches!(bad, Err(ProtocolError::Json { .. })));
    }

    #[tokio::test]
    async fn full_stream_ends_at_result() {
        let body = chunks(&[
            STARTED,
            "event: assistant\ndata: {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}\n\n",
            RESULT,
        ]);
        let events = collect(spawn_event_stream(body, CancellationToken::new(), PumpOptions::default())).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Ok(BackendEvent::SessionStarted { .. })));
        assert!(matches!(&events[2], Ok(BackendEvent::Message(m)) if m.is_result()));
    }

    #[tokio::test]
    async fn malformed_event_is_dropped_and_stream_continues() {
        let body = chunks(&[STARTED, "event: assistant\ndata: {broken\n\n", "event: error\ndata: oops\n\n", RESULT]);
        let events = collect(spawn_event_stream(body, CancellationToken::new(), PumpOptions::default())).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn end_before_result_is_connection_lost() {
        let body = chunks(&[STARTED]);
        let events = collect(spawn_event_stream(body, CancellationToken::new(), PumpOptions::default())).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Err(e) if e.is_connection_lost()));
    }

    #[tokio::test]
    async fn transport_error_is_connection_lost() {
        let items: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from(STARTED)), Err("reset by peer".into())];
        let events = collect(spawn_event_stream(futures::stream::iter(items), CancellationToken::new(), PumpOptions::default())).await;
        assert!(matches!(&events[1], Err(BackendError::ConnectionLost(m)) if m.contains("reset")));
    }

    #[tokio::test]
    async fn cancellation_ends_stream_silently() {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(4);
        let body = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = spawn_event_stream(body, cancel.clone(), PumpOptions::default());

        tx.send(Ok(Bytes::from(STARTED))).await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(BackendEvent::SessionStarted { .. }))));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn a2a_body_is_translated() {
        let body = chunks(&[
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"kind\":\"task\",\"id\":\"t-1\"}}\n\n",
            "data: {\"kind\":\"message\",\"role\":\"agent\",\"parts\":[{\"kind\":\"text\",\"text\":\"hi\"}]}\n\n",
            "data: {\"kind\":\"status-update\",\"status\":{\"state\":\"completed\"}}\n\n",
            "data: {\"kind\":\"message\",\"role\":\"agent\",\"parts\":[{\"kind\":\"text\",\"text\":\"late\"}]}\n\n",
        ]);
        let opts = PumpOptions { protocol: WireProtocol::A2a, ..Default::default() };
        let events = collect(spawn_event_stream(body, CancellationToken::new(), opts)).await;
        // task -> started + init, message, terminal result; nothing after it
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], Ok(BackendEvent::SessionStarted { native_session_id }) if native_session_id == "t-1"));
        assert!(matches!(&events[3], Ok(BackendEvent::Message(m)) if m.is_result()));
    }

    #[tokio::test]
    async fn idle_timeout_is_connection_lost() {
        tokio::time::pause();
        let (_tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(4);
        let body = tokio_stream::wrappers::ReceiverStream::new(rx);
        let opts = PumpOptions { idle_timeout: Some(Duration::from_secs(5)), ..Default::default() };
        let mut stream = spawn_event_stream(body, CancellationToken::new(), opts);

        tokio::time::advance(Duration::from_secs(6)).await;
        let item = stream.next().await;
        assert!(matches!(&item, Some(Err(BackendError::ConnectionLost(m))) if m.contains("no data")), "got {item:?}");
    }
}
