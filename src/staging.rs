//! Node-local staging area and file helpers.
//!
//! Every upload link creates a per-uid directory under the staging root
//! on the issuing node; the directory's presence is what marks this node
//! as the uid's owner for cluster routing.  In-flight upload bytes land
//! here until they are pushed to the object store, and the merge or
//! cleanup task removes the directory when the upload ends.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use std::io::Read;

/// Manages per-uid staging directories under one root.
#[derive(Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path of the staging directory for `uid`.
    pub fn dir(&self, uid: i64) -> PathBuf {
        self.root.join(uid.to_string())
    }

    /// Whether this node owns `uid` (its staging directory exists here).
    pub fn owns(&self, uid: i64) -> bool {
        self.dir(uid).is_dir()
    }

    /// Create the staging directory for `uid`.  Idempotent.
    pub fn create(&self, uid: i64) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.dir(uid))?;
        Ok(())
    }

    /// Path of the single-shot upload file for `uid`.
    pub fn object_path(&self, uid: i64, storage_name: &str) -> PathBuf {
        self.dir(uid).join(storage_name)
    }

    /// Path of one chunk file for `uid`.
    pub fn chunk_path(&self, uid: i64, chunk_index: i64) -> PathBuf {
        self.dir(uid).join(chunk_name(uid, chunk_index))
    }

    /// Remove the staging directory and everything in it.  Idempotent.
    pub fn remove(&self, uid: i64) -> anyhow::Result<()> {
        match std::fs::remove_dir_all(self.dir(uid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Backend storage name of one chunk object.
pub fn chunk_name(uid: i64, chunk_index: i64) -> String {
    format!("{uid}_{chunk_index}")
}

/// Lowercased file extension without the dot, empty if none.
pub fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Bucket an object belongs to, chosen by file suffix.
pub fn bucket_for_suffix(filename: &str) -> &'static str {
    match extension(filename).as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "bmp" => "image",
        "mp4" | "avi" | "wmv" | "mpeg" => "video",
        "mp3" | "wav" | "flac" => "audio",
        "pdf" | "doc" | "docx" | "ppt" | "pptx" | "xls" | "xlsx" => "doc",
        "zip" | "rar" | "tar" | "gz" | "7z" => "archive",
        _ => "unknown",
    }
}

/// Hex MD5 of a file, streamed in fixed windows.
pub fn md5_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 of an in-memory buffer.
pub fn md5_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Sniff a MIME type from a file's leading bytes, falling back to
/// `application/octet-stream`.
pub fn sniff_content_type(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 512];
    let n = file.read(&mut buf)?;
    Ok(sniff_bytes(&buf[..n]).to_string())
}

fn sniff_bytes(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.starts_with(b"BM") {
        "image/bmp"
    } else if data.starts_with(b"%PDF-") {
        "application/pdf"
    } else if data.starts_with(b"PK\x03\x04") {
        "application/zip"
    } else if data.starts_with(b"\x1f\x8b") {
        "application/gzip"
    } else if data.starts_with(b"ID3") || data.starts_with(b"\xff\xfb") {
        "audio/mpeg"
    } else if data.len() > 11 && &data[4..12] == b"ftypisom" {
        "video/mp4"
    } else if !data.is_empty() && data.iter().all(|b| b.is_ascii() && *b != 0) {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bucket_selection() {
        assert_eq!(bucket_for_suffix("photos/cat.PNG"), "image");
        assert_eq!(bucket_for_suffix("clip.mp4"), "video");
        assert_eq!(bucket_for_suffix("song.flac"), "audio");
        assert_eq!(bucket_for_suffix("report.docx"), "doc");
        assert_eq!(bucket_for_suffix("backup.tar"), "archive");
        assert_eq!(bucket_for_suffix("mystery.bin"), "unknown");
        assert_eq!(bucket_for_suffix("no-extension"), "unknown");
    }

    #[test]
    fn test_staging_ownership() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::new(dir.path()).unwrap();

        assert!(!staging.owns(42));
        staging.create(42).unwrap();
        assert!(staging.owns(42));
        // Creating again is a no-op.
        staging.create(42).unwrap();

        std::fs::write(staging.chunk_path(42, 0), b"data").unwrap();
        staging.remove(42).unwrap();
        assert!(!staging.owns(42));
        staging.remove(42).unwrap();
    }

    #[test]
    fn test_md5_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(md5_file(&path).unwrap(), md5_bytes(b"hello world"));
        assert_eq!(
            md5_bytes(b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_content_type_sniffing() {
        assert_eq!(sniff_bytes(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff_bytes(b"%PDF-1.7"), "application/pdf");
        assert_eq!(sniff_bytes(b"plain text here"), "text/plain; charset=utf-8");
        assert_eq!(sniff_bytes(&[0u8, 1, 2, 3]), "application/octet-stream");
    }

    #[test]
    fn test_chunk_naming() {
        assert_eq!(chunk_name(42, 7), "42_7");
    }
}
