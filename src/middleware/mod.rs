//! Request middleware. Request logging is handled by
//! `tracing_actix_web::TracingLogger`, wired in `main`.

pub mod metrics;

pub use metrics::record_metrics;
