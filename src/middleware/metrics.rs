//! # Request Metrics Middleware
//!
//! Records every request's duration and outcome into [`AppState`], keyed by
//! method and route pattern (`GET /api/v1/sessions/{id}`), so per-session
//! paths do not create one entry each.
//!
//! ## Usage:
//! ```ignore
//! App::new().wrap(actix_web::middleware::from_fn(record_metrics))
//! ```

use crate::state::AppState;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error};
use std::time::Instant;

pub async fn record_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let started = Instant::now();
    let state = req.app_data::<web::Data<AppState>>().cloned();
    let route = req.match_pattern().unwrap_or_else(|| req.path().to_string());
    let endpoint = format!("{} {}", req.method(), route);

    let result = next.call(req).await;

    if let Some(state) = state {
        let is_error = match &result {
            Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
            Err(_) => true,
        };
        state.record_endpoint_request(&endpoint, started.elapsed().as_millis() as u64, is_error);
    }

    result
}
