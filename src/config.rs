//! # Configuration Management
//!
//! Loads the relay's configuration from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables with the `APP_` prefix, nested keys separated by
//!   `__` (e.g. `APP_RELAY__DEBOUNCE_MS=250`)
//! - `HOST` / `PORT`, as set by most deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults from the `Default` impl
//!
//! ## Sections:
//! - **server**: bind address
//! - **relay**: debounce window, batching bound, idle and heartbeat timing
//! - **performance**: session capacity
//! - **audio**: input PCM format and utterance length bound
//! - **pipeline**: per-call timeout, retries, silence detection
//! - **speech / responder / claims**: external collaborators and credentials

use crate::pipeline::http::HttpSpeechConfig;
use crate::pipeline::silence::SilenceSettings;
use crate::pipeline::PipelineSettings;
use crate::session::buffer::AudioFormat;
use crate::session::SessionSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Placeholder shown instead of credentials in API responses.
pub const REDACTED: &str = "********";

/// Main application configuration.
///
/// Every section is `Clone` so handlers can take a snapshot and release the
/// lock immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioConfig,
    pub pipeline: PipelineConfig,
    pub speech: SpeechConfig,
    pub responder: ResponderConfig,
    pub claims: ClaimsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session relay timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Quiet period before buffered synthesized audio is flushed
    pub debounce_ms: u64,
    /// Upper bound on how long a batch may be held back
    pub max_batch_delay_ms: u64,
    /// Close sessions with no inbound traffic for this long
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Close connections that stop answering pings
    pub client_timeout_secs: u64,
    /// Frames buffered between the socket and the relay task
    pub inbound_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Input audio format, negotiated out of band with clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Longest utterance kept; older audio is dropped beyond this
    pub max_utterance_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// First retry delay, doubled per attempt
    pub backoff_ms: u64,
    pub silence: SilenceSettings,
}

/// Speech-to-text / text-to-speech provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub voice: String,
    pub output_format: String,
}

/// Response generator. Without an endpoint the relay echoes the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Claims store (PostgREST-style REST endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub table: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            relay: RelayConfig {
                debounce_ms: 300,
                max_batch_delay_ms: 1000,
                idle_timeout_secs: 300,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                inbound_queue: 256,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                max_utterance_ms: 30_000,
            },
            pipeline: PipelineConfig {
                timeout_ms: 10_000,
                max_retries: 2,
                backoff_ms: 200,
                silence: SilenceSettings::default(),
            },
            speech: SpeechConfig {
                endpoint: "http://127.0.0.1:9000".to_string(),
                api_key: None,
                voice: "default".to_string(),
                output_format: "pcm".to_string(),
            },
            responder: ResponderConfig::default(),
            claims: ClaimsConfig {
                url: "http://127.0.0.1:54321".to_string(),
                api_key: None,
                table: "claims".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_RELAY__DEBOUNCE_MS=250`
    /// - `APP_PIPELINE__SILENCE__ENABLED=true`
    /// - `APP_SPEECH__API_KEY=...`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Debounce window must be greater than 0"));
        }

        if self.relay.max_batch_delay_ms < self.relay.debounce_ms {
            return Err(anyhow::anyhow!(
                "Max batch delay ({}ms) cannot be shorter than the debounce window ({}ms)",
                self.relay.max_batch_delay_ms,
                self.relay.debounce_ms
            ));
        }

        if self.relay.idle_timeout_secs == 0 || self.relay.inbound_queue == 0 {
            return Err(anyhow::anyhow!("Idle timeout and inbound queue must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!("Client timeout must be longer than the heartbeat interval"));
        }

        if self.pipeline.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Pipeline timeout must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if !matches!(self.audio.bit_depth, 8 | 16) {
            return Err(anyhow::anyhow!("Unsupported bit depth {}, expected 8 or 16", self.audio.bit_depth));
        }

        if !(0.0..=1.0).contains(&self.pipeline.silence.threshold) {
            return Err(anyhow::anyhow!("Silence threshold must be between 0.0 and 1.0"));
        }

        Ok(())
    }

    /// Apply a partial runtime update from JSON.
    ///
    /// Only tuning that can change under live traffic is accepted here:
    /// relay timing, session capacity and pipeline retry policy. New values
    /// apply to sessions opened afterwards; capacity applies immediately.
    ///
    /// Example: `{"relay": {"debounce_ms": 200}, "performance": {"max_concurrent_sessions": 50}}`
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(relay) = partial.get("relay") {
            if let Some(v) = relay.get("debounce_ms").and_then(|v| v.as_u64()) {
                updated.relay.debounce_ms = v;
            }
            if let Some(v) = relay.get("max_batch_delay_ms").and_then(|v| v.as_u64()) {
                updated.relay.max_batch_delay_ms = v;
            }
            if let Some(v) = relay.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                updated.relay.idle_timeout_secs = v;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = v as usize;
            }
        }

        if let Some(pipeline) = partial.get("pipeline") {
            if let Some(v) = pipeline.get("timeout_ms").and_then(|v| v.as_u64()) {
                updated.pipeline.timeout_ms = v;
            }
            if let Some(v) = pipeline.get("max_retries").and_then(|v| v.as_u64()) {
                updated.pipeline.max_retries = v.min(u32::MAX as u64) as u32;
            }
            if let Some(v) = pipeline.get("backoff_ms").and_then(|v| v.as_u64()) {
                updated.pipeline.backoff_ms = v;
            }
        }

        // Only commit a fully valid result
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy safe to return from the API: credentials replaced.
    pub fn redacted(&self) -> Self {
        fn mask(key: &Option<String>) -> Option<String> {
            key.as_ref().filter(|k| !k.is_empty()).map(|_| REDACTED.to_string())
        }

        let mut copy = self.clone();
        copy.speech.api_key = mask(&self.speech.api_key);
        copy.responder.api_key = mask(&self.responder.api_key);
        copy.claims.api_key = mask(&self.claims.api_key);
        copy
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bit_depth: self.audio.bit_depth,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            format: self.audio_format(),
            max_utterance_ms: self.audio.max_utterance_ms,
            debounce: Duration::from_millis(self.relay.debounce_ms),
            max_batch_delay: Duration::from_millis(self.relay.max_batch_delay_ms),
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            timeout: Duration::from_millis(self.pipeline.timeout_ms),
            max_retries: self.pipeline.max_retries,
            backoff: Duration::from_millis(self.pipeline.backoff_ms),
            silence: self.pipeline.silence.clone(),
        }
    }

    pub fn speech_config(&self) -> HttpSpeechConfig {
        HttpSpeechConfig {
            endpoint: self.speech.endpoint.clone(),
            api_key: self.speech.api_key.clone(),
            voice: self.speech.voice.clone(),
            output_format: self.speech.output_format.clone(),
            format: self.audio_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay.debounce_ms, 300);
        assert_eq!(config.performance.max_concurrent_sessions, 10);
        assert!(config.responder.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_batch_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.client_timeout_secs = config.relay.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"debounce_ms": 250}, "performance": {"max_concurrent_sessions": 3}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.relay.debounce_ms, 250);
        assert_eq!(config.performance.max_concurrent_sessions, 3);
        // Untouched sections keep their values
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pipeline.timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"debounce_ms": 5000}, "pipeline": {"max_retries": 5}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.relay.debounce_ms, 300);
        assert_eq!(config.pipeline.max_retries, 2);
    }

    #[test]
    fn test_redacted_hides_credentials() {
        let mut config = AppConfig::default();
        config.speech.api_key = Some("sk-live-123".to_string());
        config.claims.api_key = Some(String::new());

        let redacted = config.redacted();
        assert_eq!(redacted.speech.api_key.as_deref(), Some(REDACTED));
        assert_eq!(redacted.claims.api_key, None);
        assert_eq!(redacted.responder.api_key, None);
    }

    #[test]
    fn test_derived_settings() {
        let config = AppConfig::default();
        let session = config.session_settings();
        assert_eq!(session.debounce, Duration::from_millis(300));
        assert_eq!(session.format.bytes_per_second(), 32_000);

        let pipeline = config.pipeline_settings();
        assert_eq!(pipeline.timeout, Duration::from_secs(10));
        assert!(!pipeline.silence.enabled);
    }
}
