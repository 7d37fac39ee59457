//! # Speech Pipeline Adapter
//!
//! Wraps the external speech-to-text / text-to-speech provider and the
//! response generator behind three calls the relay uses:
//!
//! - `transcribe(audio) -> text`
//! - `respond(turns) -> text`
//! - `synthesize(text) -> stream of audio chunks`
//!
//! ## Policies owned here:
//! - **Timeouts**: every call is bounded by `timeout`; an expired call is
//!   reported as [`PipelineError::Unavailable`]. Synthesized streams are also
//!   bounded per chunk, so a stalled provider cannot hang a session.
//! - **Retries**: `Unavailable` is retried up to `max_retries` times with
//!   exponential backoff. `Rejected` is surfaced immediately.
//! - **Utterance boundaries**: the silence policy ([`silence`]) lives here,
//!   not in the session state machine.

pub mod http;
pub mod responder;
pub mod silence;

use crate::session::Turn;
use actix_web::web::Bytes;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use silence::{SilenceDetector, SilenceSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Provider unreachable, timed out or overloaded; worth retrying
    #[error("speech pipeline unavailable: {0}")]
    Unavailable(String),

    /// Input the provider cannot use (silence, empty audio, bad text)
    #[error("speech pipeline rejected input: {0}")]
    Rejected(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Unavailable(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Lazy, finite sequence of synthesized audio chunks. Dropping it releases
/// the provider's resources.
pub type AudioStream = BoxStream<'static, PipelineResult<Bytes>>;

/// Speech-to-text and text-to-speech provider.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Transcribe one complete utterance.
    async fn transcribe(&self, audio: Vec<u8>) -> PipelineResult<String>;

    /// Start synthesizing `text`. The stream is not restartable.
    async fn synthesize(&self, text: String) -> PipelineResult<AudioStream>;
}

/// Produces the agent's reply to the conversation so far.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(&self, turns: &[Turn]) -> PipelineResult<String>;
}

/// Retry and timeout tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub silence: SilenceSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff: Duration::from_millis(200),
            silence: SilenceSettings::default(),
        }
    }
}

pub struct SpeechPipeline {
    provider: Arc<dyn SpeechProvider>,
    responder: Arc<dyn ResponseGenerator>,
    settings: PipelineSettings,
}

impl SpeechPipeline {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        responder: Arc<dyn ResponseGenerator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            provider,
            responder,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Same providers, new tuning. Sessions already running keep the
    /// pipeline they started with.
    pub fn with_settings(&self, settings: PipelineSettings) -> Self {
        Self {
            provider: self.provider.clone(),
            responder: self.responder.clone(),
            settings,
        }
    }

    /// Fresh utterance-boundary detector for a new session.
    pub fn silence_detector(&self, format: crate::session::buffer::AudioFormat) -> SilenceDetector {
        SilenceDetector::new(self.settings.silence.clone(), format)
    }

    pub async fn transcribe(&self, audio: Vec<u8>) -> PipelineResult<String> {
        if audio.is_empty() {
            return Err(PipelineError::Rejected("no audio captured".to_string()));
        }
        let text = self
            .with_retry("transcribe", || self.provider.transcribe(audio.clone()))
            .await?;
        if text.trim().is_empty() {
            return Err(PipelineError::Rejected("no speech recognized".to_string()));
        }
        Ok(text)
    }

    pub async fn respond(&self, turns: &[Turn]) -> PipelineResult<String> {
        self.with_retry("respond", || self.responder.respond(turns))
            .await
    }

    /// Open a synthesized stream whose chunks are each bounded by the
    /// per-call timeout.
    pub async fn synthesize(&self, text: &str) -> PipelineResult<AudioStream> {
        if text.trim().is_empty() {
            return Err(PipelineError::Rejected("nothing to synthesize".to_string()));
        }
        let inner = self
            .with_retry("synthesize", || self.provider.synthesize(text.to_string()))
            .await?;
        Ok(with_chunk_timeout(inner, self.settings.timeout))
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.settings.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Unavailable(format!(
                    "{} timed out after {}ms",
                    operation,
                    self.settings.timeout.as_millis()
                ))),
            };

            match result {
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff.saturating_mul(1 << attempt.min(16));
                    attempt += 1;
                    warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying pipeline call");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// End the stream with `Unavailable` if the provider goes quiet for longer
/// than `per_chunk`.
fn with_chunk_timeout(inner: AudioStream, per_chunk: Duration) -> AudioStream {
    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(per_chunk, inner.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
            Ok(Some(Err(err))) => Some((Err(err), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(PipelineError::Unavailable("synthesis stream stalled".to_string())),
                None,
            )),
        }
    })
    .boxed()
}
