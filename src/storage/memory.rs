//! In-memory object store for tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;

use super::backend::ObjectStore;

/// Holds all objects in a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn make_bucket(
        &self,
        _bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }

    fn get_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let key = (bucket.to_string(), name.to_string());
        Box::pin(async move {
            let objects = self.objects.lock().expect("mutex poisoned");
            let data = objects
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("no such object: {}/{}", key.0, key.1))?;
            let total = data.len() as u64;
            if offset >= total {
                return Ok(Bytes::new());
            }
            let remaining = total - offset;
            let want = if length < 0 {
                remaining
            } else {
                (length as u64).min(remaining)
            };
            Ok(data.slice(offset as usize..(offset + want) as usize))
        })
    }

    fn put_object(
        &self,
        bucket: &str,
        name: &str,
        local_path: &Path,
        _content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = (bucket.to_string(), name.to_string());
        let local_path = local_path.to_path_buf();
        Box::pin(async move {
            let data = std::fs::read(&local_path)?;
            let mut objects = self.objects.lock().expect("mutex poisoned");
            objects.insert(key, Bytes::from(data));
            Ok(())
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = (bucket.to_string(), name.to_string());
        Box::pin(async move {
            let mut objects = self.objects.lock().expect("mutex poisoned");
            objects.remove(&key);
            Ok(())
        })
    }

    fn object_size(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let key = (bucket.to_string(), name.to_string());
        Box::pin(async move {
            let objects = self.objects.lock().expect("mutex poisoned");
            let data = objects
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("no such object: {}/{}", key.0, key.1))?;
            Ok(data.len() as u64)
        })
    }
}
