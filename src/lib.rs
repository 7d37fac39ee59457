//! # voice-relay
//!
//! Realtime voice-session relay. Each WebSocket connection on
//! `/ws/voice-agent` becomes one session: microphone audio streams in, is
//! transcribed, answered and synthesized, and the synthesized audio streams
//! back in debounced batches.
//!
//! ## Module map:
//! - [`codec`]: frames on the wire (audio, chat text, control tokens)
//! - [`session`]: state machine, audio buffers, output batching, registry
//! - [`pipeline`]: speech provider and response generator adapters
//! - [`relay`]: the per-session task tying them together
//! - [`websocket`]: the transport actor and upgrade handler
//! - [`claims`]: read access to the claims store
//! - [`config`], [`error`], [`state`], [`health`], [`middleware`],
//!   [`handlers`]: the HTTP service around it

pub mod claims;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod pipeline;
pub mod relay;
pub mod session;
pub mod state;
pub mod websocket;

use actix_web::web;

/// Register every route. Expects `web::Data<state::AppState>` in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config))
            .route("/sessions", web::get().to(handlers::list_sessions))
            .route("/sessions/{id}", web::get().to(handlers::get_session))
            .route("/claims", web::get().to(handlers::list_claims)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws/voice-agent", web::get().to(websocket::voice_agent_ws));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::AppState;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_metrics_middleware_records_route_patterns() {
        let state = AppState::for_tests(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(actix_web::middleware::from_fn(middleware::record_metrics))
                .configure(configure),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/api/v1/sessions/a").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/api/v1/sessions/b").to_request()).await;

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /health"].request_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /api/v1/sessions/{id}"].error_count, 2);

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["sessions"]["lifetime"]["opened"], 0);
        assert_eq!(body["overall"]["total_requests"], 3);
    }

    #[actix_web::test]
    async fn test_plain_get_on_websocket_route_is_not_upgraded() {
        let state = AppState::for_tests(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws/voice-agent").to_request()).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        // The reserved slot is released again
        assert!(state.registry.is_empty());
    }
}
