//! Composition root: one instance of each coordination service over a
//! single store backend.

use crate::client_ip::ClientIpResolver;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dedup::{DedupConfig, DedupCoordinator};
use crate::error::Result;
use crate::health::{self, HealthStatus};
use crate::lock::{LockManager, DEFAULT_LOCK_TTL};
use crate::rate_limit_config::RateLimitConfig;
use crate::rate_limiter::RateLimiter;
use crate::store::{MemoryStore, RedisClient, RedisStore, TtlStore};
use crate::webhook::{
    HttpTransport, MemoryWebhookRepository, RedisWebhookRepository, ReqwestTransport,
    SweepReport, WebhookConfig, WebhookEngine, WebhookRepository,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one worker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub deliveries: SweepReport,
    /// Expired store entries dropped from memory.
    pub purged: usize,
}

#[derive(Clone)]
pub struct Gatekeeper {
    store: Arc<dyn TtlStore>,
    backend: &'static str,
    locks: LockManager,
    dedup: DedupCoordinator,
    rate_limiter: RateLimiter,
    webhooks: WebhookEngine,
    ip_resolver: ClientIpResolver,
}

impl Gatekeeper {
    /// Connects to Redis when `REDIS_URL` is set, otherwise runs in-process.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let rate_limits = config.rate_limit_config()?;

        let (store, repository, backend): (Arc<dyn TtlStore>, Arc<dyn WebhookRepository>, _) =
            match config.redis_url() {
                Some(url) => {
                    let client = RedisClient::connect(url).await?;
                    info!(redis = %client.connection_info(), "Connected to Redis");
                    (
                        Arc::new(RedisStore::new(client.clone())),
                        Arc::new(RedisWebhookRepository::new(client)),
                        "redis",
                    )
                }
                None => {
                    info!("No REDIS_URL configured, using the in-process store");
                    (
                        Arc::new(MemoryStore::new()),
                        Arc::new(MemoryWebhookRepository::new()),
                        "memory",
                    )
                }
            };

        Ok(Self::assemble(
            store,
            backend,
            repository,
            Arc::new(ReqwestTransport::default()),
            Arc::new(SystemClock),
            Parts {
                lock_ttl: config.lock_ttl(),
                dedup: config.dedup_config(),
                rate_limits,
                webhooks: config.webhook_config(),
            },
        ))
    }

    /// In-process backend with default settings and the given HTTP transport
    /// and clock.
    pub fn in_memory(transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(
            Arc::new(MemoryStore::new()),
            "memory",
            Arc::new(MemoryWebhookRepository::new()),
            transport,
            clock,
            Parts::default(),
        )
    }

    fn assemble(
        store: Arc<dyn TtlStore>,
        backend: &'static str,
        repository: Arc<dyn WebhookRepository>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        parts: Parts,
    ) -> Self {
        let locks = LockManager::new(store.clone(), parts.lock_ttl);
        let dedup = DedupCoordinator::new(store.clone(), locks.clone(), parts.dedup);
        let rate_limiter = RateLimiter::new(store.clone(), parts.rate_limits);
        let webhooks = WebhookEngine::new(repository, transport, clock, parts.webhooks);

        Self {
            store,
            backend,
            locks,
            dedup,
            rate_limiter,
            webhooks,
            ip_resolver: ClientIpResolver::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TtlStore> {
        &self.store
    }

    pub fn backend(&self) -> &str {
        self.backend
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn dedup(&self) -> &DedupCoordinator {
        &self.dedup
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn webhooks(&self) -> &WebhookEngine {
        &self.webhooks
    }

    pub fn ip_resolver(&self) -> &ClientIpResolver {
        &self.ip_resolver
    }

    /// Attempts due deliveries, then drops expired entries the store still holds.
    pub async fn sweep(&self) -> Result<MaintenanceReport> {
        let deliveries = self.webhooks.process_pending().await?;
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Purged expired store entries");
        }
        Ok(MaintenanceReport { deliveries, purged })
    }

    pub async fn health_check(&self) -> HealthStatus {
        health::check(self.store.as_ref(), self.backend).await
    }
}

struct Parts {
    lock_ttl: std::time::Duration,
    dedup: DedupConfig,
    rate_limits: RateLimitConfig,
    webhooks: WebhookConfig,
}

impl Default for Parts {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            dedup: DedupConfig::default(),
            rate_limits: RateLimitConfig::default(),
            webhooks: WebhookConfig::default(),
        }
    }
}
