//! Persistent pack storage.
//!
//! Packs are cached across sessions keyed by their URL. Store failures are
//! never fatal: every implementation degrades to a miss and a warning, and
//! the loader re-fetches.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;

/// A durable URL-keyed blob store. Exactly one record per URL.
pub trait PackStore: Send + Sync {
    fn get(&self, url: &str) -> Option<Bytes>;
    fn put(&self, url: &str, bytes: &Bytes);
    fn clear(&self);
}

/// Derive the record file name for a URL.
fn key_for(url: &str) -> String {
    let hash = blake3::hash(url.as_bytes());
    format!("{}.pack", hex::encode(hash.as_bytes()))
}

/// Representation of a directory that holds cached packs, one file per
/// URL.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    path: PathBuf,
}

impl FileSystemStore {
    /// Construct a store around the specified directory, creating it (and
    /// any parents) when missing.
    pub fn new<P: Into<PathBuf>>(path: P) -> io::Result<Self> {
        let path: PathBuf = path.into();
        if path.exists() {
            let metadata = path.metadata()?;
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!(
                        "the supplied path already points to a file: {}",
                        path.display()
                    ),
                ));
            }
        } else {
            fs::create_dir_all(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl PackStore for FileSystemStore {
    fn get(&self, url: &str) -> Option<Bytes> {
        let file = self.path.join(key_for(url));
        match fs::read(&file) {
            Ok(bytes) => {
                tracing::debug!(url, len = bytes.len(), "pack store hit");
                Some(Bytes::from(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(url, error = %e, "pack store read failed, treating as miss");
                None
            }
        }
    }

    fn put(&self, url: &str, bytes: &Bytes) {
        let file = self.path.join(key_for(url));
        if let Err(e) = fs::write(&file, bytes) {
            tracing::warn!(url, error = %e, "pack store write failed, continuing without cache");
        }
    }

    fn clear(&self) {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "pack store clear failed");
                return;
            }
        };
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "pack") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// In-memory store, used by tests and as the no-persistence fallback.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackStore for MemoryStore {
    fn get(&self, url: &str) -> Option<Bytes> {
        self.records.lock().unwrap().get(url).cloned()
    }

    fn put(&self, url: &str, bytes: &Bytes) {
        self.records
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.clone());
    }

    fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemStore::new(dir.path()).unwrap();
        let url = "https://packs.example/toolchain.pack";

        assert_eq!(store.get(url), None);
        store.put(url, &Bytes::from_static(b"pack-bytes"));
        assert_eq!(store.get(url), Some(Bytes::from_static(b"pack-bytes")));

        // one record per URL: rewrites replace
        store.put(url, &Bytes::from_static(b"newer"));
        assert_eq!(store.get(url), Some(Bytes::from_static(b"newer")));

        store.clear();
        assert_eq!(store.get(url), None);
    }

    #[test]
    fn urls_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemStore::new(dir.path()).unwrap();
        store.put("url-a", &Bytes::from_static(b"a"));
        store.put("url-b", &Bytes::from_static(b"b"));

        assert_eq!(store.get("url-a"), Some(Bytes::from_static(b"a")));
        assert_eq!(store.get("url-b"), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn rejects_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(FileSystemStore::new(&file).is_err());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.put("u", &Bytes::from_static(b"x"));
        assert_eq!(store.get("u"), Some(Bytes::from_static(b"x")));
        store.clear();
        assert_eq!(store.get("u"), None);
    }
}
