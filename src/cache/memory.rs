//! In-memory shared cache.
//!
//! Implements the same semantics as the Redis backend over a mutex-guarded
//! map, including lazy TTL expiry and atomic token acquire/release.  Used
//! by tests and single-node deployments.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Cache;

/// A plain value with an optional expiry deadline.
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Inner {
    /// Fetch a live entry, dropping it if its TTL has lapsed.
    fn live(&mut self, key: &str) -> Option<&Entry> {
        if self.entries.get(key).is_some_and(Entry::expired) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }
}

/// Shared cache held entirely in process memory.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            Ok(inner.live(&key).map(|e| e.value.clone()))
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            inner.entries.insert(
                key,
                Entry {
                    value,
                    expires_at: None,
                },
            );
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
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            if inner.live(&key).is_some() {
                return Ok(false);
            }
            inner.entries.insert(
                key,
                Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    fn refresh_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            if inner.live(&key).is_none() {
                return Ok(false);
            }
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
            Ok(true)
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            inner.entries.remove(&key);
            Ok(())
        })
    }

    fn incr(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            let current: i64 = inner
                .live(&key)
                .map(|e| e.value.parse().unwrap_or(0))
                .unwrap_or(0);
            let next = current + 1;
            inner.entries.insert(
                key,
                Entry {
                    value: next.to_string(),
                    expires_at: None,
                },
            );
            Ok(next)
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
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            inner.hashes.entry(key).or_default().insert(field, value);
            Ok(())
        })
    }

    fn hget_all(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let inner = self.inner.lock().expect("mutex poisoned");
            Ok(inner.hashes.get(&key).cloned().unwrap_or_default())
        })
    }

    fn hdel(
        &self,
        key: &str,
        field: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            if let Some(hash) = inner.hashes.get_mut(&key) {
                hash.remove(&field);
            }
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
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            let deadline = Instant::now() + Duration::from_millis(ttl_ms);
            match inner.live(&key) {
                // Reentrant refresh for our own token.
                Some(entry) if entry.value == token => {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.expires_at = Some(deadline);
                    }
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => {
                    inner.entries.insert(
                        key,
                        Entry {
                            value: token,
                            expires_at: Some(deadline),
                        },
                    );
                    Ok(true)
                }
            }
        })
    }

    fn release_token(
        &self,
        key: &str,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let token = token.to_string();
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            match inner.live(&key) {
                Some(entry) if entry.value == token => {
                    inner.entries.remove(&key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}
