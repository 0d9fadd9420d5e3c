//! Redis-backed shared cache.
//!
//! Uses a `ConnectionManager` so a dropped connection is re-established
//! transparently.  The lock primitives run as Lua scripts, making the
//! check-then-act sequences atomic on the server.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::Cache;

/// Acquire script: refresh our own TTL, else set-if-absent.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
    return "OK"
else
    return redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2])
end
"#;

/// Release script: delete only if we still hold the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Shared cache backed by a Redis server.
pub struct RedisCache {
    manager: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisCache {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

impl Cache for RedisCache {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let value: Option<String> = conn.get(&key).await?;
            Ok(value)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.set::<_, _, ()>(&key, &value).await?;
            Ok(())
        })
    }

    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            // SET key value NX PX ttl -- single round trip.
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            Ok(result.is_some())
        })
    }

    fn refresh_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let set: bool = conn.pexpire(&key, ttl.as_millis() as i64).await?;
            Ok(set)
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.del::<_, ()>(&key).await?;
            Ok(())
        })
    }

    fn incr(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let value: i64 = conn.incr(&key, 1).await?;
            Ok(value)
        })
    }

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.hset::<_, _, _, ()>(&key, &field, &value).await?;
            Ok(())
        })
    }

    fn hget_all(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let map: HashMap<String, String> = conn.hgetall(&key).await?;
            Ok(map)
        })
    }

    fn hdel(
        &self,
        key: &str,
        field: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let field = field.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.hdel::<_, _, ()>(&key, &field).await?;
            Ok(())
        })
    }

    fn acquire_token(
        &self,
        key: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let token = token.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let reply: Option<String> = self
                .acquire
                .key(&key)
                .arg(&token)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok(reply.as_deref() == Some("OK"))
        })
    }

    fn release_token(
        &self,
        key: &str,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let token = token.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let deleted: i64 = self
                .release
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await?;
            Ok(deleted == 1)
        })
    }
}
