//! # Health Check
//!
//! `GET /health` and `GET /api/v1/health`. Always answers 200; `status` is
//! `"healthy"` while the translation backend link is ready and `"degraded"`
//! otherwise, since clients can still connect and queue requests while the
//! link reconnects.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let relay = &state.relay;
    let link = relay.link();
    let link_state = link.state();
    let config = &state.config;

    let status = if link.is_ready() {
        "healthy"
    } else {
        "degraded"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "state": link_state,
            "connection_attempts": link.attempt_count(),
            "connections_established": link.connection_count(),
            "source_language": config.upstream.source_language,
            "target_language": config.upstream.target_language
        },
        "relay": {
            "active_sessions": relay.registry().len(),
            "in_flight": queue_usage(relay.in_flight(), config.relay.max_in_flight),
            "counters": relay.stats()
        },
        "history": {
            "records": relay.store().count()
        },
        "memory": get_memory_info()
    }))
}

fn queue_usage(in_flight: usize, capacity: usize) -> serde_json::Value {
    let usage = if capacity > 0 {
        in_flight as f64 / capacity as f64
    } else {
        0.0
    };

    let load = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "current": in_flight,
        "capacity": capacity,
        "usage_percent": (usage * 100.0).round(),
        "load": load
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
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
