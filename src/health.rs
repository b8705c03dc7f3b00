//! # Health Check Endpoints
//!
//! - `GET /health`: liveness plus a summary of the task store
//! - `GET /metrics`: per-endpoint request statistics
//!
//! Monitoring systems poll `/health`; a 200 means the process is up and the
//! task store answers.

use crate::state::AppState;
use crate::tasks::TaskStore;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::collections::BTreeMap;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let metrics = state.metrics_snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "target_format": config.target_profile(),
        "tasks": {
            "by_status": task_counts(state.store.as_ref()),
            "background_jobs": state.supervisor.active_jobs()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats
    }))
}

/// Number of tasks per status, always listing all four statuses.
fn task_counts(store: &dyn TaskStore) -> BTreeMap<&'static str, usize> {
    let mut counts: BTreeMap<&'static str, usize> =
        ["pending", "processing", "complete", "error"].into_iter().map(|s| (s, 0)).collect();
    for record in store.list_all().values() {
        *counts.entry(record.status()).or_default() += 1;
    }
    counts
}
