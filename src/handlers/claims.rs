//! `GET /api/v1/claims`: the claims list, ordered by id.

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

pub async fn list_claims(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let claims = state.claims.list_claims().await.map_err(|err| {
        warn!(error = %err, "Claims store request failed");
        err
    })?;

    Ok(HttpResponse::Ok().json(json!({
        "count": claims.len(),
        "claims": claims
    })))
}

#[cfg(test)]
mod tests {
    use crate::claims::{ClaimRecord, ClaimsError, ClaimsStore, InMemoryClaimsStore};
    use crate::config::AppConfig;
    use crate::pipeline::http::HttpSpeechProvider;
    use crate::pipeline::responder::EchoResponder;
    use crate::state::AppState;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct DownStore;

    #[async_trait]
    impl ClaimsStore for DownStore {
        async fn list_claims(&self) -> Result<Vec<ClaimRecord>, ClaimsError> {
            Err(ClaimsError::Unavailable("connection refused".to_string()))
        }
    }

    fn state_with(claims: Arc<dyn ClaimsStore>) -> AppState {
        let config = AppConfig::default();
        let provider = Arc::new(HttpSpeechProvider::new(reqwest::Client::new(), config.speech_config()));
        AppState::with_components(config, provider, Arc::new(EchoResponder), claims)
    }

    #[actix_web::test]
    async fn test_lists_claims() {
        let store = InMemoryClaimsStore::new(vec![ClaimRecord {
            id: 7,
            policy_number: "POL-7".to_string(),
            first_name: "Rosa".to_string(),
            last_name: "Parks".to_string(),
            status: Some(false),
            date: None,
        }]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(Arc::new(store))))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/claims").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["claims"][0]["policy_number"], "POL-7");
        assert_eq!(body["claims"][0]["status"], false);
    }

    #[actix_web::test]
    async fn test_store_failure_is_bad_gateway() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(Arc::new(DownStore))))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/claims").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
