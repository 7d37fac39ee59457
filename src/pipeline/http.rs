//! HTTP speech provider.
//!
//! - `POST {endpoint}/v1/transcribe` with the raw utterance as the body and
//!   an `x-audio-format` header (`pcm_s16le;rate=16000;channels=1`), answered
//!   with JSON `{"text": "..."}`.
//! - `POST {endpoint}/v1/synthesize` with JSON `{text, voice, format,
//!   sample_rate}`, answered with a streamed audio body.

use crate::pipeline::{AudioStream, PipelineError, PipelineResult, SpeechProvider};
use crate::session::buffer::AudioFormat;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpSpeechConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub output_format: String,
    pub format: AudioFormat,
}

pub struct HttpSpeechProvider {
    client: reqwest::Client,
    config: HttpSpeechConfig,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'a str,
    sample_rate: u32,
}

impl HttpSpeechProvider {
    pub fn new(client: reqwest::Client, config: HttpSpeechConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    fn audio_format_header(&self) -> String {
        let format = &self.config.format;
        let encoding = if format.bit_depth == 8 { "pcm_u8" } else { "pcm_s16le" };
        format!("{};rate={};channels={}", encoding, format.sample_rate, format.channels)
    }
}

/// Map a non-success status to the pipeline taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> PipelineError {
    let message = format!("provider returned {}: {}", status, body.trim());
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        PipelineError::Rejected(message)
    } else {
        PipelineError::Unavailable(message)
    }
}

fn transport_error(err: reqwest::Error) -> PipelineError {
    PipelineError::Unavailable(err.to_string())
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn transcribe(&self, audio: Vec<u8>) -> PipelineResult<String> {
        debug!(bytes = audio.len(), "Sending utterance for transcription");

        let request = self
            .client
            .post(self.url("v1/transcribe"))
            .header("content-type", "application/octet-stream")
            .header("x-audio-format", self.audio_format_header())
            .body(audio);
        let response = self.authorize(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Unavailable(format!("invalid transcription response: {}", e)))?;
        Ok(parsed.text)
    }

    async fn synthesize(&self, text: String) -> PipelineResult<AudioStream> {
        let body = SynthesizeRequest {
            text: &text,
            voice: &self.config.voice,
            format: &self.config.output_format,
            sample_rate: self.config.format.sample_rate,
        };
        let request = self.client.post(self.url("v1/synthesize")).json(&body);
        let response = self.authorize(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(endpoint: &str) -> HttpSpeechProvider {
        HttpSpeechProvider::new(
            reqwest::Client::new(),
            HttpSpeechConfig {
                endpoint: endpoint.to_string(),
                api_key: None,
                voice: "alloy".to_string(),
                output_format: "pcm".to_string(),
                format: AudioFormat::default(),
            },
        )
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, ""), PipelineError::Rejected(_)));
        assert!(matches!(classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""), PipelineError::Rejected(_)));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
    }

    #[test]
    fn test_urls_and_format_header() {
        let provider = provider("https://speech.example.com/");
        assert_eq!(provider.url("v1/transcribe"), "https://speech.example.com/v1/transcribe");
        assert_eq!(provider.audio_format_header(), "pcm_s16le;rate=16000;channels=1");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        // Port 9 (discard) on localhost is not listening in test environments
        let result = provider("http://127.0.0.1:9").transcribe(vec![0; 4]).await;
        assert!(matches!(result, Err(PipelineError::Unavailable(_))));
    }
}
