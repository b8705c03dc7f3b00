//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Thread Safety Pattern:
//! - The configuration is read-only after startup, so it sits behind a
//!   plain `Arc`.
//! - The task store, dispatcher and supervisor synchronise internally and
//!   are shared as `Arc`s.
//! - Request metrics are updated on every request and use
//!   `Arc<RwLock<T>>`: many readers (the health endpoint) or one writer
//!   (the metrics middleware).

use crate::config::AppConfig;
use crate::tasks::{Dispatcher, Supervisor, TaskStore};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn TaskStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub supervisor: Arc<Supervisor>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Request counters collected by the metrics middleware.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by method and route pattern, e.g. `GET /status/{task_id}`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            dispatcher,
            supervisor,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Count one finished request against `endpoint`.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
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

    /// Copy of the metrics, so the lock is released immediately.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
