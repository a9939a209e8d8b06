//! At-most-once execution of logically identical operations.
//!
//! Two requests are the same operation when their fingerprints match: the
//! request type, the actor, and the payload with volatile fields stripped and
//! keys sorted. The first caller takes a lock on the fingerprint, runs the
//! operation and caches its result; concurrent duplicates poll the cache until
//! the result shows up or their wait times out. An owner whose operation fails
//! leaves a short-lived failure marker, and only that marker lets a waiter run
//! the operation itself.

use crate::error::{GatekeeperError, Result};
use crate::lock::LockManager;
use crate::normalize::{digest, normalize, DEFAULT_VOLATILE_FIELDS};
use crate::store::TtlStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEDUP_KEY_PREFIX: &str = "gatekeeper:dedup:";

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub cache_ttl: Duration,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    /// TTL of the execution lock. It is renewed while the operation runs, so
    /// it only bounds how long a crashed owner blocks duplicates.
    pub lock_ttl: Duration,
    pub volatile_fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(30),
            volatile_fields: DEFAULT_VOLATILE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Clone)]
pub struct DedupCoordinator {
    store: Arc<dyn TtlStore>,
    locks: LockManager,
    config: DedupConfig,
}

impl DedupCoordinator {
    pub fn new(store: Arc<dyn TtlStore>, locks: LockManager, config: DedupConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn normalize(&self, data: &Value) -> Value {
        normalize(data, &self.config.volatile_fields)
    }

    pub fn fingerprint(&self, request_type: &str, data: &Value, actor: &str) -> String {
        let normalized = self.normalize(data).to_string();
        digest(&[request_type, &normalized, actor])
    }

    fn result_key(fingerprint: &str) -> String {
        format!("{}result:{}", DEDUP_KEY_PREFIX, fingerprint)
    }

    fn lock_key(fingerprint: &str) -> String {
        format!("{}lock:{}", DEDUP_KEY_PREFIX, fingerprint)
    }

    fn failed_key(fingerprint: &str) -> String {
        format!("{}failed:{}", DEDUP_KEY_PREFIX, fingerprint)
    }

    /// Long enough for every waiter to see the marker on one of its polls.
    fn failure_marker_ttl(&self) -> Duration {
        (self.config.poll_interval * 4).max(Duration::from_secs(1))
    }

    async fn cached<T: DeserializeOwned>(&self, result_key: &str) -> Result<Option<T>> {
        match self.store.get(result_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Runs `operation` at most once per fingerprint within the cache window.
    ///
    /// A cached result is returned without calling `operation`. While another
    /// caller is running the same operation this call waits for its result;
    /// if that caller reports that its operation failed, this call competes to
    /// run the operation itself. A lock that disappears without a result or a
    /// failure report is not taken over. The whole wait is bounded by
    /// `wait_timeout` and ends in [`GatekeeperError::Timeout`].
    pub async fn execute_once<T, E, F, Fut>(
        &self,
        request_type: &str,
        actor: &str,
        data: &Value,
        cache_ttl: Option<Duration>,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<GatekeeperError>,
    {
        let fingerprint = self.fingerprint(request_type, data, actor);
        let result_key = Self::result_key(&fingerprint);
        let lock_key = Self::lock_key(&fingerprint);
        let failed_key = Self::failed_key(&fingerprint);
        let cache_ttl = cache_ttl.unwrap_or(self.config.cache_ttl);
        let deadline = Instant::now() + self.config.wait_timeout;

        loop {
            if let Some(cached) = self.cached::<T>(&result_key).await? {
                debug!(op = request_type, actor = actor, fingerprint = %fingerprint, "Returning cached result");
                return Ok(cached);
            }

            match self
                .locks
                .acquire_key(lock_key.clone(), Some(self.config.lock_ttl))
                .await
            {
                Ok(token) => {
                    return self
                        .locks
                        .hold(token, || async {
                            // The previous owner may have finished between our cache
                            // check and our acquisition.
                            if let Some(cached) = self.cached::<T>(&result_key).await? {
                                return Ok(cached);
                            }
                            self.store.delete(&failed_key).await?;

                            let outcome = operation().await;
                            match &outcome {
                                Ok(value) => {
                                    self.store_result(&result_key, &fingerprint, value, cache_ttl)
                                        .await
                                }
                                Err(_) => self.mark_failed(&failed_key, &fingerprint).await,
                            }
                            outcome
                        })
                        .await;
                }
                Err(GatekeeperError::LockHeld { .. }) => {
                    debug!(op = request_type, actor = actor, fingerprint = %fingerprint, "Duplicate in flight, waiting for its result");
                    match self
                        .wait_for_result(&result_key, &failed_key, deadline)
                        .await
                    {
                        Ok(Some(value)) => return Ok(value),
                        Ok(None) => continue,
                        Err(err) => {
                            if matches!(err, GatekeeperError::Timeout(_)) {
                                warn!(op = request_type, actor = actor, fingerprint = %fingerprint, "Timed out waiting for duplicate operation");
                            }
                            return Err(err.into());
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn store_result<T: Serialize>(
        &self,
        result_key: &str,
        fingerprint: &str,
        value: &T,
        ttl: Duration,
    ) {
        let stored = match serde_json::to_string(value) {
            Ok(raw) => self.store.set(result_key, &raw, Some(ttl)).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            warn!(fingerprint = %fingerprint, error = %err, "Failed to cache operation result");
        }
    }

    async fn mark_failed(&self, failed_key: &str, fingerprint: &str) {
        let ttl = self.failure_marker_ttl();
        if let Err(err) = self.store.set(failed_key, "1", Some(ttl)).await {
            warn!(fingerprint = %fingerprint, error = %err, "Failed to record operation failure");
        }
    }

    /// Polls for the owner's result. `Ok(None)` means the owner reported that
    /// its operation failed.
    async fn wait_for_result<T: DeserializeOwned>(
        &self,
        result_key: &str,
        failed_key: &str,
        deadline: Instant,
    ) -> Result<Option<T>> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(GatekeeperError::Timeout(self.config.wait_timeout));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            if let Some(value) = self.cached(result_key).await? {
                return Ok(Some(value));
            }
            if self.store.get(failed_key).await?.is_some() {
                return Ok(None);
            }
        }
    }

    /// Drops a cached result so the next identical request runs again.
    pub async fn forget(&self, request_type: &str, actor: &str, data: &Value) -> Result<bool> {
        let fingerprint = self.fingerprint(request_type, data, actor);
        self.store.delete(&Self::result_key(&fingerprint)).await
    }

    /// Compares two results of what should be the same logical operation.
    /// A mismatch is logged, never raised.
    pub fn compare<A: Serialize, B: Serialize>(&self, label: &str, a: &A, b: &B) -> bool {
        let (a, b) = match (serde_json::to_value(a), serde_json::to_value(b)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => {
                warn!(op = label, error = %err, "Could not serialize results for comparison");
                return false;
            }
        };

        let (a, b) = (self.normalize(&a), self.normalize(&b));
        if a == b {
            return true;
        }
        warn!(
            op = label,
            left = %a,
            right = %b,
            "Results of equivalent operations diverge"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DEFAULT_LOCK_TTL;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(config: DedupConfig) -> DedupCoordinator {
        let store: Arc<dyn TtlStore> = Arc::new(MemoryStore::new());
        let locks = LockManager::new(Arc::clone(&store), DEFAULT_LOCK_TTL);
        DedupCoordinator::new(store, locks, config)
    }

    #[test]
    fn test_fingerprint_ignores_order_and_volatile_fields() {
        let dedup = coordinator(DedupConfig::default());
        let a = dedup.fingerprint(
            "save_settings",
            &json!({"menu": {"hidden": ["a"], "order": 2}, "color": "red"}),
            "7",
        );
        let b = dedup.fingerprint(
            "save_settings",
            &json!({"color": "red", "_wpnonce": "n1", "menu": {"order": 2, "hidden": ["a"], "timestamp": 99}}),
            "7",
        );
        assert_eq!(a, b);

        let other_actor = dedup.fingerprint("save_settings", &json!({"color": "red"}), "8");
        let other_type = dedup.fingerprint("reset_settings", &json!({"color": "red"}), "7");
        assert_ne!(other_actor, other_type);
        assert_ne!(a, other_actor);
    }

    #[tokio::test]
    async fn test_cached_result_skips_operation() {
        let dedup = coordinator(DedupConfig::default());
        let calls = AtomicUsize::new(0);
        let data = json!({"color": "blue"});

        for _ in 0..3 {
            let result = dedup
                .execute_once("save", "1", &data, None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GatekeeperError>(json!({"saved": true}))
                })
                .await
                .unwrap();
            assert_eq!(result, json!({"saved": true}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicates_run_once() {
        let dedup = Arc::new(coordinator(DedupConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..8 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            tasks.spawn(async move {
                dedup
                    .execute_once("save", "1", &json!({"color": "green"}), None, || async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok::<_, GatekeeperError>(json!({"run": n}))
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| *r == json!({"run": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let dedup = Arc::new(coordinator(DedupConfig {
            wait_timeout: Duration::from_secs(3),
            lock_ttl: Duration::from_secs(60),
            ..DedupConfig::default()
        }));

        let owner = Arc::clone(&dedup);
        let slow = tokio::spawn(async move {
            owner
                .execute_once("export", "1", &json!({}), None, || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, GatekeeperError>(1)
                })
                .await
        });
        tokio::task::yield_now().await;

        let waited = dedup
            .execute_once("export", "1", &json!({}), None, || async {
                Ok::<_, GatekeeperError>(2)
            })
            .await;
        assert!(matches!(waited, Err(GatekeeperError::Timeout(_))));
        assert_eq!(slow.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_takes_over_after_failed_owner() {
        let dedup = Arc::new(coordinator(DedupConfig::default()));

        let owner = Arc::clone(&dedup);
        let failing = tokio::spawn(async move {
            owner
                .execute_once("import", "1", &json!({"file": "a"}), None, || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Err::<i32, _>(GatekeeperError::Validation("corrupt file".into()))
                })
                .await
        });
        tokio::task::yield_now().await;

        let value = dedup
            .execute_once("import", "1", &json!({"file": "a"}), None, || async {
                Ok::<_, GatekeeperError>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(failing.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_slower_than_lock_ttl_runs_once() {
        let dedup = Arc::new(coordinator(DedupConfig {
            lock_ttl: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(60),
            ..DedupConfig::default()
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..3 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            tasks.spawn(async move {
                dedup
                    .execute_once("export", "1", &json!({"format": "csv"}), None, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(25)).await;
                        Ok::<_, GatekeeperError>(json!({"rows": 1200}))
                    })
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), json!({"rows": 1200}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_past_lock_ttl_times_out_instead_of_rerunning() {
        let dedup = Arc::new(coordinator(DedupConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let owner = Arc::clone(&dedup);
        let owner_calls = Arc::clone(&calls);
        let slow = tokio::spawn(async move {
            owner
                .execute_once("export", "1", &json!({}), None, || async move {
                    owner_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(45)).await;
                    Ok::<_, GatekeeperError>(1)
                })
                .await
        });
        tokio::task::yield_now().await;

        let waited = dedup
            .execute_once("export", "1", &json!({}), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GatekeeperError>(2)
            })
            .await;
        assert!(matches!(waited, Err(GatekeeperError::Timeout(_))));
        assert_eq!(slow.await.unwrap().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_expires_with_cache_ttl() {
        let dedup = coordinator(DedupConfig::default());
        let calls = AtomicUsize::new(0);
        let data = json!({"k": "v"});
        let ttl = Some(Duration::from_secs(5));

        for _ in 0..2 {
            dedup
                .execute_once("save", "1", &data, ttl, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GatekeeperError>(())
                })
                .await
                .unwrap();
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forget_clears_cached_result() {
        let dedup = coordinator(DedupConfig::default());
        let data = json!({"k": "v"});
        dedup
            .execute_once("save", "1", &data, None, || async { Ok::<_, GatekeeperError>(1) })
            .await
            .unwrap();
        assert!(dedup.forget("save", "1", &data).await.unwrap());

        let second = dedup
            .execute_once("save", "1", &data, None, || async { Ok::<_, GatekeeperError>(2) })
            .await
            .unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn test_compare_normalizes_before_diffing() {
        let dedup = coordinator(DedupConfig::default());
        assert!(dedup.compare(
            "save",
            &json!({"a": 1, "b": {"c": 2}, "timestamp": 1}),
            &json!({"b": {"c": 2}, "a": 1, "timestamp": 2}),
        ));
        assert!(!dedup.compare("save", &json!({"a": 1}), &json!({"a": 2})));
    }
}
