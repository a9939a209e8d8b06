use super::{TtlStore, WindowIncrement};
use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Single-process store. One mutex guards the whole map, which makes every
/// operation atomic; expired entries are dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| GatekeeperError::Internal("Failed to acquire store lock".to_string()))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn count(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Result<u64> {
        match Self::live(entries, key, now) {
            Some(entry) => entry.value.parse::<u64>().map_err(|_| {
                GatekeeperError::Store(format!("Counter '{}' holds a non-numeric value", key))
            }),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl TtlStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        Ok(Self::live(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.entries()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let owned = Self::live(&mut entries, key, now).is_some_and(|entry| entry.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        Ok(Self::live(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match Self::live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_within(
        &self,
        keys: &[String],
        window: Duration,
        limit: u64,
    ) -> Result<WindowIncrement> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        let mut counts = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            let count = Self::count(&mut entries, key, now)?;
            if count >= limit {
                return Ok(WindowIncrement::Rejected { index });
            }
            counts.push(count);
        }

        for (key, count) in keys.iter().zip(counts.iter_mut()) {
            *count += 1;
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: String::new(),
                expires_at: Some(now + window),
            });
            entry.value = count.to_string();
            if entry.expires_at.is_none() {
                entry.expires_at = Some(now + window);
            }
        }
        Ok(WindowIncrement::Admitted(counts))
    }

    async fn ping(&self) -> Result<()> {
        self.entries().map(|_| ())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}
