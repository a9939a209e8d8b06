//! Shared TTL key-value store.
//!
//! Every cross-request invariant in this crate (one live lock per key, one
//! execution per fingerprint, one counter per window) rests on the atomic
//! operations of [`TtlStore`]. Implementations must make each method atomic
//! with respect to concurrent callers in other processes; callers never
//! compose a read and a write to emulate one of them.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryStore;
pub use self::redis::{RedisClient, RedisStore};

#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Value of a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write. `None` means the entry never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Writes only when no live entry exists. Returns whether the write happened.
    async fn create_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes the entry only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Remaining lifetime of a live entry; `None` when absent or non-expiring.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Resets the TTL of the entry only while it still holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Fixed-window admission over several counters as one atomic step.
    ///
    /// When any live counter already holds `limit` or more, nothing changes
    /// and the first such counter is reported. Otherwise every counter is
    /// incremented: an absent key starts at 1 with TTL `window`, a live key
    /// keeps its remaining TTL.
    async fn increment_within(
        &self,
        keys: &[String],
        window: Duration,
        limit: u64,
    ) -> Result<WindowIncrement>;

    async fn ping(&self) -> Result<()>;

    /// Drops expired entries a backend keeps around until they are touched.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowIncrement {
    /// Counter values after the increment, in key order.
    Admitted(Vec<u64>),
    /// Position in `keys` of the first counter at its limit.
    Rejected { index: usize },
}
