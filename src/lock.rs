//! Short-lived mutual exclusion over the shared store.
//!
//! A lock is a store entry whose value is a random ownership token. It is
//! taken with a single `create_if_absent` and given back with
//! `compare_and_delete`, so a holder whose lock already expired and was
//! re-acquired by someone else cannot release the newer owner's lock. While an
//! operation runs under [`LockManager::hold`] the lock is renewed, so the TTL
//! only ends a lock whose owner stopped running.

use crate::error::{GatekeeperError, Result};
use crate::normalize::{digest, normalize, DEFAULT_VOLATILE_FIELDS};
use crate::store::TtlStore;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_KEY_PREFIX: &str = "gatekeeper:lock:";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Proof of ownership returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    value: String,
    ttl: Duration,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn TtlStore>,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn TtlStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Deterministic key for `(op_type, actor, payload)`. Payload key order
    /// and volatile fields such as nonces do not matter.
    pub fn lock_key(op_type: &str, actor: &str, payload: &Value) -> String {
        let payload = normalize(payload, DEFAULT_VOLATILE_FIELDS).to_string();
        format!("{}{}", LOCK_KEY_PREFIX, digest(&[op_type, actor, &payload]))
    }

    pub async fn acquire(
        &self,
        op_type: &str,
        actor: &str,
        payload: &Value,
        ttl: Option<Duration>,
    ) -> Result<LockToken> {
        let key = Self::lock_key(op_type, actor, payload);
        self.acquire_key(key, ttl).await.map_err(|err| {
            if let GatekeeperError::LockHeld { retry_after } = &err {
                debug!(
                    op = op_type,
                    actor = actor,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Lock is held by another operation"
                );
            }
            err
        })
    }

    /// Acquires a lock under an already derived key.
    pub async fn acquire_key(&self, key: String, ttl: Option<Duration>) -> Result<LockToken> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let value = Uuid::new_v4().simple().to_string();

        if self.store.create_if_absent(&key, &value, Some(ttl)).await? {
            return Ok(LockToken { key, value, ttl });
        }

        let retry_after = self.store.ttl(&key).await?.unwrap_or(ttl);
        Err(GatekeeperError::LockHeld { retry_after })
    }

    /// Reentrant acquisition: succeeds without contention when the store
    /// still holds `token`, otherwise competes for the key like a fresh caller.
    pub async fn reacquire(&self, token: &LockToken, ttl: Option<Duration>) -> Result<LockToken> {
        if self.store.get(&token.key).await?.as_deref() == Some(token.value.as_str()) {
            return Ok(token.clone());
        }
        self.acquire_key(token.key.clone(), ttl).await
    }

    /// Gives the lock back. Returns `false` when the token no longer owns it.
    pub async fn release(&self, token: &LockToken) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&token.key, &token.value)
            .await?;
        if !released {
            debug!(key = %token.key, "Lock already expired or owned by someone else");
        }
        Ok(released)
    }

    /// Pushes the expiry of a still-owned lock a full TTL ahead.
    pub async fn extend(&self, token: &LockToken) -> Result<bool> {
        self.store
            .compare_and_expire(&token.key, &token.value, token.ttl)
            .await
    }

    /// Renews the lock every third of its TTL. Returns once the lock is lost.
    async fn keep_alive(&self, token: &LockToken) {
        let period = (token.ttl / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(period).await;
            match self.extend(token).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %token.key, "Lock lost while its operation was still running");
                    return;
                }
                Err(err) => warn!(key = %token.key, error = %err, "Failed to extend lock"),
            }
        }
    }

    pub async fn is_locked(&self, op_type: &str, actor: &str, payload: &Value) -> Result<bool> {
        let key = Self::lock_key(op_type, actor, payload);
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Runs `operation` while holding the lock for `(op_type, actor, payload)`.
    ///
    /// The lock is released on success and on error. If the returned future
    /// is dropped or `operation` panics, the release is spawned on the
    /// current runtime instead.
    pub async fn run_exclusive<T, E, F, Fut>(
        &self,
        op_type: &str,
        actor: &str,
        payload: &Value,
        ttl: Option<Duration>,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<GatekeeperError>,
    {
        let token = self.acquire(op_type, actor, payload, ttl).await?;
        self.hold(token, operation).await
    }

    /// Runs `operation` under a lock that is already held, renewing it until
    /// the operation finishes, then releases it.
    pub async fn hold<T, E, F, Fut>(&self, token: LockToken, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut guard = ReleaseGuard {
            store: Arc::clone(&self.store),
            token: Some(token.clone()),
        };

        let operation = operation();
        tokio::pin!(operation);
        let result = tokio::select! {
            biased;
            result = &mut operation => result,
            _ = self.keep_alive(&token) => operation.await,
        };

        // The guard keeps the token until the release has completed, so a
        // drop in the middle of it still releases.
        let released = self.release(&token).await;
        guard.token = None;
        if let Err(err) = released {
            warn!(key = %token.key, error = %err, "Failed to release lock, it will expire by TTL");
        }
        result
    }
}

/// Releases a lock that was not given back on the normal path.
struct ReleaseGuard {
    store: Arc<dyn TtlStore>,
    token: Option<LockToken>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(err) = store.compare_and_delete(&token.key, &token.value).await {
                        warn!(key = %token.key, error = %err, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %token.key, "No runtime to release lock, it will expire by TTL");
            }
        }
    }
}
