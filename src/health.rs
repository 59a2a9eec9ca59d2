//! # Health and Metrics Endpoints
//!
//! - `GET /health` and `GET /api/v1/health`: liveness plus a load summary
//! - `GET /api/v1/metrics`: HTTP endpoint stats and session lifecycle counters

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let live_sessions = state.manager.registry().len().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "model": config.upstream.model,
            "response_modality": config.upstream.response_modality,
            "api_key_configured": !config.upstream.api_key.is_empty()
        },
        "sessions": load_status(live_sessions, config.relay.max_concurrent_sessions),
        "connections": metrics.open_connections,
        "memory": memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let lifecycle = state.manager.stats();
    let live_sessions = state.manager.registry().len().await;

    let mut endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "endpoints": endpoints
        },
        "sessions": {
            "live": live_sessions,
            "open_connections": metrics.open_connections,
            "lifecycle": lifecycle
        },
        "memory": memory_info()
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn load_status(live: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { live as f64 / max as f64 } else { 0.0 };

    let status = if usage >= 1.0 {
        "full"
    } else if usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "live": live,
        "max": max,
        "usage_percent": (usage * 100.0).round()
    })
}

#[cfg(target_os = "linux")]
fn memory_info() -> serde_json::Value {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return json!({ "available": false });
    };

    let field_bytes = |name: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": field_bytes("VmRSS:"),
        "virtual_memory_bytes": field_bytes("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> serde_json::Value {
    json!({ "available": false })
}
