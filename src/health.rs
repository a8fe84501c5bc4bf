use crate::session::manager::SessionManager;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(
    state: web::Data<AppState>,
    sessions: web::Data<SessionManager>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let registry = sessions.summary();

    let session_usage = if registry.max_sessions > 0 {
        registry.total_sessions as f64 / registry.max_sessions as f64
    } else {
        0.0
    };
    let load = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": metrics.active_sessions,
            "turns_completed": metrics.turns_completed,
            "turns_cancelled": metrics.turns_cancelled,
            "turns_failed": metrics.turns_failed
        },
        "sessions": {
            "load": load,
            "total": registry.total_sessions,
            "max": registry.max_sessions,
            "by_state": registry.state_counts
        },
        "providers": {
            "stt": config.pipeline.stt_url,
            "llm": config.pipeline.llm_url,
            "tts": config.pipeline.tts_url
        },
        "memory": memory_info()
    }))
}

pub async fn detailed_metrics(
    state: web::Data<AppState>,
    sessions: web::Data<SessionManager>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let registry = sessions.summary();

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
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "turns": {
            "completed": metrics.turns_completed,
            "cancelled": metrics.turns_cancelled,
            "failed": metrics.turns_failed
        },
        "sessions": {
            "active": metrics.active_sessions,
            "registered": registry.total_sessions,
            "max": registry.max_sessions,
            "by_state": registry.state_counts
        },
        "endpoints": endpoint_stats,
        "memory": memory_info()
    }))
}

/// Resident/virtual memory of this process, where the platform exposes it.
fn memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|l| l.starts_with(name))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
