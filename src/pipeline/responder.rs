//! Response generators: the text-producing step between transcription and
//! synthesis.

use crate::pipeline::http::classify_status;
use crate::pipeline::{PipelineError, PipelineResult, ResponseGenerator};
use crate::session::{Speaker, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Repeats the latest user turn. Used when no responder endpoint is
/// configured, which makes a bare relay usable for client development.
pub struct EchoResponder;

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn respond(&self, turns: &[Turn]) -> PipelineResult<String> {
        turns
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::User)
            .map(|turn| turn.text.clone())
            .ok_or_else(|| PipelineError::Rejected("no user turn to respond to".to_string()))
    }
}

/// Posts the conversation to an external endpoint:
/// `{"messages": [{"role": "user", "text": "..."}, ...]}` → `{"text": "..."}`.
pub struct HttpResponder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct RespondRequest<'a> {
    messages: Vec<RespondMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct RespondMessage<'a> {
    role: &'static str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct RespondResponse {
    text: String,
}

impl HttpResponder {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

fn request_body(turns: &[Turn]) -> RespondRequest<'_> {
    RespondRequest {
        messages: turns
            .iter()
            .map(|turn| RespondMessage {
                role: match turn.speaker {
                    Speaker::User => "user",
                    Speaker::Agent => "assistant",
                },
                text: &turn.text,
            })
            .collect(),
    }
}

#[async_trait]
impl ResponseGenerator for HttpResponder {
    async fn respond(&self, turns: &[Turn]) -> PipelineResult<String> {
        let mut request = self.client.post(&self.endpoint).json(&request_body(turns));
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: RespondResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Unavailable(format!("invalid responder reply: {}", e)))?;

        if parsed.text.trim().is_empty() {
            return Err(PipelineError::Rejected("responder returned no text".to_string()));
        }
        Ok(parsed.text)
    }
}
