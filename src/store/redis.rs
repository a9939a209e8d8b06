use super::{TtlStore, WindowIncrement};
use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// Reply: {1, count...} when admitted, {0, index} when rejected.
const FIXED_WINDOW_ADMIT: &str = r#"
local limit = tonumber(ARGV[2])
for i, key in ipairs(KEYS) do
    local current = tonumber(redis.call('GET', key) or '0')
    if current >= limit then
        return {0, i - 1}
    end
end
local reply = {1}
for _, key in ipairs(KEYS) do
    local count = redis.call('INCR', key)
    if count == 1 or redis.call('PTTL', key) < 0 then
        redis.call('PEXPIRE', key, ARGV[1])
    end
    reply[#reply + 1] = count
end
return reply
"#;

/// Connection handle shared by the TTL store and the webhook repository.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| GatekeeperError::Store(format!("Failed to create Redis client: {}", e)))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self { client, connection })
    }

    /// A multiplexed connection; clones share one socket.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn connection_info(&self) -> String {
        self.client.get_connection_info().addr.to_string()
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Ping failed: {}", e)))
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// [`TtlStore`] backed by Redis. Conditional writes map to `SET NX PX`; the
/// compound operations run as Lua scripts so Redis executes them atomically.
/// Expiry is native, so there is nothing to purge.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    compare_and_delete: Script,
    compare_and_expire: Script,
    admit: Script,
}

impl RedisStore {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
            admit: Script::new(FIXED_WINDOW_ADMIT),
        }
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }
}

#[async_trait]
impl TtlStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.connection();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("GET failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.client.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("SET failed: {}", e)))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.client.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("SET NX failed: {}", e)))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.client.connection();
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("DEL failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.client.connection();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Compare-and-delete failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.client.connection();
        let remaining: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("PTTL failed: {}", e)))?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.connection();
        let extended: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Compare-and-expire failed: {}", e)))?;
        Ok(extended > 0)
    }

    async fn increment_within(
        &self,
        keys: &[String],
        window: Duration,
        limit: u64,
    ) -> Result<WindowIncrement> {
        let mut conn = self.client.connection();
        let mut invocation = self.admit.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let reply: Vec<u64> = invocation
            .arg(millis(window))
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Counter increment failed: {}", e)))?;

        match reply.split_first() {
            Some((1, counts)) => Ok(WindowIncrement::Admitted(counts.to_vec())),
            Some((0, [index])) => Ok(WindowIncrement::Rejected {
                index: *index as usize,
            }),
            _ => Err(GatekeeperError::Store(format!(
                "Unexpected counter script reply: {:?}",
                reply
            ))),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
