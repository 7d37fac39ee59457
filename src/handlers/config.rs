//! Runtime configuration API.
//!
//! - `GET /api/v1/config`: current configuration, credentials redacted
//! - `PUT /api/v1/config`: partial update of the live-tunable sections
//!   (`relay`, `performance`, `pipeline`); the new session capacity applies
//!   to the registry immediately

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let updated = state
        .update_config(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use crate::config::{AppConfig, REDACTED};
    use crate::state::AppState;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_get_config_redacts_credentials() {
        let mut config = AppConfig::default();
        config.speech.api_key = Some("secret".to_string());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::for_tests(config)))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["speech"]["api_key"], REDACTED);
        assert_eq!(body["config"]["relay"]["debounce_ms"], 300);
    }

    #[actix_web::test]
    async fn test_update_config_changes_capacity() {
        let state = AppState::for_tests(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(serde_json::json!({"performance": {"max_concurrent_sessions": 4}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.registry.capacity(), 4);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::for_tests(AppConfig::default())))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(serde_json::json!({"relay": {"debounce_ms": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
