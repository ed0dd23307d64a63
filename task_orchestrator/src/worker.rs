//! Request/response invocation of a registered worker.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::registry::CapabilityCard;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRequest {
    pub task_id: String,
    pub task_type: String,
    pub description: String,
    /// Results of the task's dependencies, keyed by task id
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl WorkerResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            artifacts: Vec::new(),
        }
    }

    /// Payload stored in the plan's result map.
    pub fn into_value(self) -> Value {
        if self.artifacts.is_empty() {
            Value::String(self.text)
        } else {
            serde_json::to_value(&self).unwrap_or(Value::String(self.text))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireError {
    Detailed {
        #[serde(default)]
        code: Option<i64>,
        message: String,
    },
    Message(String),
}

impl WireError {
    fn message(&self) -> String {
        match self {
            WireError::Detailed {
                code: Some(code),
                message,
            } => format!("[{}] {}", code, message),
            WireError::Detailed { code: None, message } => message.clone(),
            WireError::Message(message) => message.clone(),
        }
    }
}

/// Successful reply body. `text` is mandatory so unrelated objects are rejected.
#[derive(Debug, Deserialize)]
struct WireBody {
    text: String,
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

impl From<WireBody> for WorkerResponse {
    fn from(body: WireBody) -> Self {
        Self {
            text: body.text,
            artifacts: body.artifacts,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireReply {
    Failure { error: WireError },
    Wrapped { result: WireBody },
    Bare(WireBody),
}

/// Parse a worker reply body into a response or an error.
pub fn parse_reply(body: &str) -> Result<WorkerResponse> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| anyhow!("Malformed worker reply: {}", e))?;
    let reply: WireReply = serde_json::from_value(value)
        .map_err(|_| anyhow!("Malformed worker reply: expected text, result or error"))?;
    match reply {
        WireReply::Failure { error } => Err(anyhow!("{}", error.message())),
        WireReply::Wrapped { result } => Ok(result.into()),
        WireReply::Bare(body) => Ok(body.into()),
    }
}

/// Sends one task to one worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn invoke(&self, card: &CapabilityCard, request: WorkerRequest) -> Result<WorkerResponse>;
}

/// JSON-over-HTTP worker client; POSTs the request to the card's url.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    #[instrument(skip(self, card, request), fields(agent = %card.name, task_id = %request.task_id))]
    async fn invoke(&self, card: &CapabilityCard, request: WorkerRequest) -> Result<WorkerResponse> {
        debug!("Invoking worker at {}", card.url);

        let response = self
            .client
            .post(&card.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Worker {} unreachable: {}", card.name, e);
                anyhow!("Failed to reach worker: {}", e)
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read worker reply: {}", e))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<WireReply>(&body) {
                Ok(WireReply::Failure { error }) => error.message(),
                _ => body,
            };
            error!("Worker {} returned status {}", card.name, status.as_u16());
            return Err(anyhow!("Worker returned status {}: {}", status.as_u16(), detail));
        }

        parse_reply(&body)
    }
}
