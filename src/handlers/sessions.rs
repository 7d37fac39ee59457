//! Read-only view of the Session Registry.

use crate::error::AppResult;
use crate::session::registry::SessionId;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.registry.list();
    HttpResponse::Ok().json(json!({
        "count": sessions.len(),
        "capacity": state.registry.capacity(),
        "sessions": sessions
    }))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = SessionId::from(path.as_str());
    let session = state.registry.lookup(&id)?;
    Ok(HttpResponse::Ok().json(session))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::state::AppState;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_list_and_lookup() {
        let state = AppState::for_tests(AppConfig::default());
        let ticket = state.registry.register(Some("10.0.0.7:41000".to_string())).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], ticket.id.as_str());
        assert_eq!(body["sessions"][0]["state"], "idle");

        let uri = format!("/api/v1/sessions/{}", ticket.id);
        let req = test::TestRequest::get().uri(&uri).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["peer"], "10.0.0.7:41000");
    }

    #[actix_web::test]
    async fn test_unknown_session_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::for_tests(AppConfig::default())))
                .configure(crate::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/sessions/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
