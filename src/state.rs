//! # Application State
//!
//! Shared by every HTTP worker and every websocket actor:
//! - the loaded configuration
//! - the lifecycle manager (and through it the session registry)
//! - per-endpoint HTTP metrics
//!
//! Everything here is behind an `Arc`, so cloning the state is cheap.

use crate::config::AppConfig;
use crate::session::LifecycleManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    pub manager: LifecycleManager,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,

    pub error_count: u64,

    /// Websocket connections currently open, with or without a session.
    pub open_connections: u32,

    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, manager: LifecycleManager) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    // A panic while holding the metrics lock leaves the counters usable
    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
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

    pub fn connection_opened(&self) {
        self.metrics_mut().open_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.open_connections = metrics.open_connections.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
