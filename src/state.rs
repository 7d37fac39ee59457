//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: current configuration, replaceable at runtime
//! - **metrics**: HTTP request counters, per endpoint
//! - **counters**: session lifecycle counters, updated lock-free by relays
//! - **registry**: the Session Registry (the only state shared between sessions)
//! - **pipeline**: the speech pipeline new sessions are started with
//! - **claims**: the claims store collaborator
//!
//! ## Arc<RwLock<T>> Pattern
//! Config and metrics follow the usual pattern: many readers, one writer,
//! snapshots cloned out so no lock is held while serializing a response.
//! Session counters are plain atomics because every relay task bumps them.

use crate::claims::{ClaimsStore, RestClaimsStore};
use crate::config::AppConfig;
use crate::pipeline::http::HttpSpeechProvider;
use crate::pipeline::responder::{EchoResponder, HttpResponder};
use crate::pipeline::{ResponseGenerator, SpeechPipeline, SpeechProvider};
use crate::session::registry::SessionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub counters: Arc<SessionCounters>,
    pub registry: Arc<SessionRegistry>,
    pipeline: Arc<RwLock<Arc<SpeechPipeline>>>,
    pub claims: Arc<dyn ClaimsStore>,
    pub start_time: Instant,
}

/// HTTP request metrics collected by the metrics middleware.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /path pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Session lifecycle counters since startup.
#[derive(Debug, Default)]
pub struct SessionCounters {
    opened: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    pipeline_errors: AtomicU64,
    decode_errors: AtomicU64,
    audio_bytes_in: AtomicU64,
    audio_bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionCountersSnapshot {
    pub opened: u64,
    pub rejected: u64,
    pub closed: u64,
    pub pipeline_errors: u64,
    pub decode_errors: u64,
    pub audio_bytes_in: u64,
    pub audio_bytes_out: u64,
}

impl SessionCounters {
    pub fn session_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pipeline_error(&self) {
        self.pipeline_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_in(&self, bytes: usize) {
        self.audio_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn audio_out(&self, bytes: usize) {
        self.audio_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionCountersSnapshot {
        SessionCountersSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            pipeline_errors: self.pipeline_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            audio_bytes_in: self.audio_bytes_in.load(Ordering::Relaxed),
            audio_bytes_out: self.audio_bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build the state with the HTTP collaborators described by `config`.
    pub fn new(config: AppConfig) -> Self {
        let client = reqwest::Client::new();

        let provider: Arc<dyn SpeechProvider> =
            Arc::new(HttpSpeechProvider::new(client.clone(), config.speech_config()));

        let responder: Arc<dyn ResponseGenerator> = match config.responder.endpoint.clone() {
            Some(endpoint) if !endpoint.is_empty() => {
                info!(endpoint = %endpoint, "Using HTTP response generator");
                Arc::new(HttpResponder::new(client.clone(), endpoint, config.responder.api_key.clone()))
            }
            _ => {
                info!("No responder endpoint configured, echoing user turns");
                Arc::new(EchoResponder)
            }
        };

        let claims: Arc<dyn ClaimsStore> = Arc::new(RestClaimsStore::new(
            client,
            config.claims.url.clone(),
            config.claims.table.clone(),
            config.claims.api_key.clone(),
        ));

        Self::with_components(config, provider, responder, claims)
    }

    /// Build the state around caller-supplied collaborators.
    pub fn with_components(
        config: AppConfig,
        provider: Arc<dyn SpeechProvider>,
        responder: Arc<dyn ResponseGenerator>,
        claims: Arc<dyn ClaimsStore>,
    ) -> Self {
        let pipeline = SpeechPipeline::new(provider, responder, config.pipeline_settings());
        Self {
            registry: Arc::new(SessionRegistry::new(config.performance.max_concurrent_sessions)),
            pipeline: Arc::new(RwLock::new(Arc::new(pipeline))),
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            counters: Arc::new(SessionCounters::default()),
            claims,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Pipeline for a session opening now.
    pub fn pipeline(&self) -> Arc<SpeechPipeline> {
        self.pipeline.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a partial JSON update, then push the result into the live
    /// registry and pipeline. Returns the new configuration.
    pub fn update_config(&self, json: &str) -> anyhow::Result<AppConfig> {
        let updated = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.update_from_json(json)?;
            config.clone()
        };

        self.registry.set_capacity(updated.performance.max_concurrent_sessions);
        {
            let mut pipeline = self.pipeline.write().unwrap_or_else(PoisonError::into_inner);
            let retuned = pipeline.with_settings(updated.pipeline_settings());
            *pipeline = Arc::new(retuned);
        }

        info!(
            max_sessions = updated.performance.max_concurrent_sessions,
            debounce_ms = updated.relay.debounce_ms,
            "Configuration updated"
        );
        Ok(updated)
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State with an unreachable speech provider, the echo responder and an
    /// in-memory claims store.
    pub(crate) fn for_tests(config: AppConfig) -> Self {
        let provider = Arc::new(HttpSpeechProvider::new(
            reqwest::Client::new(),
            crate::pipeline::http::HttpSpeechConfig {
                endpoint: "http://127.0.0.1:9".to_string(),
                ..config.speech_config()
            },
        ));
        AppState::with_components(
            config,
            provider,
            Arc::new(EchoResponder),
            Arc::new(crate::claims::InMemoryClaimsStore::default()),
        )
    }
}
