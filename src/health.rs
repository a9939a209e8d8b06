use crate::store::TtlStore;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub backend: String,
    pub store: ServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

/// Pings the store; every coordination primitive is unavailable without it.
pub async fn check(store: &dyn TtlStore, backend: &str) -> HealthStatus {
    let now = SystemTime::now();
    let uptime = now
        .duration_since(*START_TIME)
        .unwrap_or_default()
        .as_secs();

    let started = Instant::now();
    let store_status = match store.ping().await {
        Ok(()) => ServiceStatus {
            status: "healthy".to_string(),
            response_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(e) => ServiceStatus {
            status: "unavailable".to_string(),
            response_time_ms: started.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    };

    let overall = if store_status.error.is_none() {
        "healthy"
    } else {
        "unhealthy"
    };

    HealthStatus {
        status: overall.to_string(),
        timestamp: now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        backend: backend.to_string(),
        store: store_status,
    }
}
