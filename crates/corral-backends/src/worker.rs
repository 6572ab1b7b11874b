//! HTTP client for the worker process that runs inside containers and cloud
//! apps, plus the request bodies both sides share.

use std::collections::HashMap;
use std::time::Duration;

use corral_core::backend::{EventStream, PlanDecision};
use corral_core::errors::BackendError;
use corral_stream::{spawn_event_stream, PumpOptions, WireProtocol};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Request header selecting the event dialect of a streamed response.
pub const PROTOCOL_HEADER: &str = "x-corral-protocol";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub working_dir: String,
    pub mode: String,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerBody {
    pub answers: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileBody {
    pub file_path: String,
}

/// Reply of the answer / approve-plan endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolvedReply {
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileReply {
    #[serde(default)]
    pub content: Option<String>,
}

/// Thin typed wrapper over the worker HTTP surface.
#[derive(Clone)]
pub struct WorkerClient {
    client: Client,
    protocol: WireProtocol,
    idle_timeout: Duration,
}

impl WorkerClient {
    pub fn new(protocol: WireProtocol) -> Self {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default HTTP client");
            Client::new()
        });
        Self { client, protocol, idle_timeout: STREAM_IDLE_TIMEOUT }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// One probe of `GET /api/health`.
    pub async fn health(&self, base: &str) -> bool {
        match self.client.get(format!("{base}/api/health")).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(base, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Probe up to `attempts` times with a fixed `delay` between probes.
    pub async fn wait_healthy(&self, base: &str, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts {
            if self.health(base).await {
                tracing::debug!(base, attempt, "worker healthy");
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    pub async fn start(
        &self,
        base: &str,
        body: &StartBody,
        cancel: CancellationToken,
    ) -> Result<EventStream, BackendError> {
        let req = self.client.post(format!("{base}/api/sessions")).json(body);
        self.stream(req, cancel).await
    }

    pub async fn message(
        &self,
        base: &str,
        native_id: &str,
        body: &MessageBody,
        cancel: CancellationToken,
    ) -> Result<EventStream, BackendError> {
        let req = self.client.post(format!("{base}/api/sessions/{native_id}/message")).json(body);
        self.stream(req, cancel).await
    }

    pub async fn delete(&self, base: &str, native_id: &str) -> Result<(), BackendError> {
        let resp = self.send(self.client.delete(format!("{base}/api/sessions/{native_id}"))).await?;
        checked(resp).await.map(drop)
    }

    pub async fn answer(
        &self,
        base: &str,
        native_id: &str,
        answers: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        let body = AnswerBody { answers: answers.clone() };
        let req = self.client.post(format!("{base}/api/sessions/{native_id}/answer")).json(&body);
        let reply: ResolvedReply = json_reply(self.send(req).await?).await?;
        Ok(reply.resolved)
    }

    pub async fn approve_plan(
        &self,
        base: &str,
        native_id: &str,
        decision: &PlanDecision,
    ) -> Result<bool, BackendError> {
        let req = self.client.post(format!("{base}/api/sessions/{native_id}/approve-plan")).json(decision);
        let reply: ResolvedReply = json_reply(self.send(req).await?).await?;
        Ok(reply.resolved)
    }

    pub async fn active(&self, base: &str) -> Result<Vec<Value>, BackendError> {
        let reply: Value = json_reply(self.send(self.client.get(format!("{base}/api/sessions/active"))).await?).await?;
        Ok(match reply {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("sessions") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
    }

    /// `Ok(None)` when the worker has no such file.
    pub async fn read_file(&self, base: &str, path: &str) -> Result<Option<String>, BackendError> {
        let body = ReadFileBody { file_path: path.to_string() };
        let resp = self.send(self.client.post(format!("{base}/api/files/read")).json(&body)).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let reply: FileReply = json_reply(resp).await?;
        Ok(reply.content)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        req.send().await.map_err(|e| BackendError::ConnectionLost(e.to_string()))
    }

    async fn stream(&self, req: RequestBuilder, cancel: CancellationToken) -> Result<EventStream, BackendError> {
        let req = match self.protocol {
            WireProtocol::A2a => req.header(PROTOCOL_HEADER, "a2a"),
            WireProtocol::Native => req,
        };
        let resp = checked(self.send(req.header("accept", "text/event-stream")).await?).await?;
        let opts = PumpOptions { protocol: self.protocol, idle_timeout: Some(self.idle_timeout) };
        Ok(spawn_event_stream(resp.bytes_stream().boxed(), cancel, opts))
    }
}

async fn checked(resp: Response) -> Result<Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::from_status(status, body))
}

async fn json_reply<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    checked(resp)
        .await?
        .json()
        .await
        .map_err(|e| BackendError::Protocol(format!("invalid worker reply: {e}")))
}
