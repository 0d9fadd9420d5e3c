//! Local filesystem object store.
//!
//! Objects are stored as `<root>/<bucket>/<name>`.  All writes follow
//! the temp-fsync-rename pattern so a crash mid-write never leaves a
//! half-written object visible.

use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use super::backend::ObjectStore;

/// Stores objects on the local filesystem.
pub struct LocalStore {
    /// Root directory for all buckets.
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    /// Resolve bucket/name to an absolute path, rejecting traversal.
    fn resolve(&self, bucket: &str, name: &str) -> anyhow::Result<PathBuf> {
        for part in [bucket, name] {
            for component in Path::new(part).components() {
                if matches!(component, std::path::Component::ParentDir) {
                    anyhow::bail!("path traversal detected in object key: {bucket}/{name}");
                }
            }
        }
        Ok(self.root.join(bucket).join(name))
    }

    fn temp_path(&self) -> PathBuf {
        let tag: u64 = rand::thread_rng().gen();
        self.root.join(".tmp").join(format!("tmp-{tag:016x}"))
    }
}

impl ObjectStore for LocalStore {
    fn make_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            std::fs::create_dir_all(self.root.join(&bucket))?;
            Ok(())
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let path = self.resolve(&bucket, &name)?;
            let mut file = std::fs::File::open(&path)
                .map_err(|e| anyhow::anyhow!("open {bucket}/{name}: {e}"))?;
            let total = file.metadata()?.len();
            if offset >= total {
                return Ok(Bytes::new());
            }
            let remaining = total - offset;
            let want = if length < 0 {
                remaining
            } else {
                (length as u64).min(remaining)
            };
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; want as usize];
            file.read_exact(&mut buf)?;
            Ok(Bytes::from(buf))
        })
    }

    fn put_object(
        &self,
        bucket: &str,
        name: &str,
        local_path: &Path,
        _content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        let local_path = local_path.to_path_buf();
        Box::pin(async move {
            let final_path = self.resolve(&bucket, &name)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            // temp-fsync-rename so readers never see a partial object.
            let tmp_path = self.temp_path();
            {
                let mut src = std::fs::File::open(&local_path)?;
                let mut dst = std::fs::File::create(&tmp_path)?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = src.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    dst.write_all(&buf[..n])?;
                }
                dst.sync_all()?;
            }
            std::fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let path = self.resolve(&bucket, &name)?;
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn object_size(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let path = self.resolve(&bucket, &name)?;
            Ok(std::fs::metadata(&path)?.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn put_bytes(store: &LocalStore, bucket: &str, name: &str, data: &[u8]) {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, data).unwrap();
        store.make_bucket(bucket).await.unwrap();
        store
            .put_object(bucket, name, &staged, "application/octet-stream")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_then_windowed_get() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        put_bytes(&store, "image", "1.png", b"0123456789").await;

        let all = store.get_object("image", "1.png", 0, -1).await.unwrap();
        assert_eq!(&all[..], b"0123456789");

        let window = store.get_object("image", "1.png", 3, 4).await.unwrap();
        assert_eq!(&window[..], b"3456");

        // Past-the-end reads truncate instead of failing.
        let tail = store.get_object("image", "1.png", 8, 100).await.unwrap();
        assert_eq!(&tail[..], b"89");
        let empty = store.get_object("image", "1.png", 20, 4).await.unwrap();
        assert!(empty.is_empty());

        assert_eq!(store.object_size("image", "1.png").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        put_bytes(&store, "doc", "a.txt", b"hello").await;

        store.delete_object("doc", "a.txt").await.unwrap();
        assert!(store.get_object("doc", "a.txt", 0, -1).await.is_err());
        // Second delete is a no-op.
        store.delete_object("doc", "a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        assert!(store.get_object("image", "../secret", 0, -1).await.is_err());
        assert!(store.delete_object("..", "x").await.is_err());
    }
}
