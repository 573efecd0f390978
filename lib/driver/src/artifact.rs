//! Source hashing and the persistent artifact cache.
//!
//! Identical inputs short-circuit the pipeline: the driver hashes the
//! canonicalized source set and looks the hash up before invoking the
//! foreign toolchain. A record is wasm bytes plus a JSON metadata
//! sidecar. Cache failures are never fatal; they degrade to a logged
//! miss.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::SourceSet;

/// Hash of the canonical form of a source set: paths in byte order, each
/// contribution length-prefixed. Deterministic across processes.
pub fn source_hash(sources: &SourceSet) -> String {
    let mut hasher = blake3::Hasher::new();
    for (path, content) in sources.iter() {
        hasher.update(&(path.len() as u32).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update(&(content.len() as u32).to_le_bytes());
        hasher.update(content.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Unix seconds at publish time.
    pub produced_at: u64,
    pub input_size: u64,
    pub output_size: u64,
    pub optimizations: String,
    pub target: String,
}

impl ArtifactMetadata {
    pub(crate) fn new(input_size: u64, output_size: u64) -> Self {
        Self {
            produced_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            input_size,
            output_size,
            optimizations: "default".to_string(),
            target: goscript_pack::ARCH_TARGET.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub wasm: Bytes,
    pub metadata: ArtifactMetadata,
}

/// Durable hash-keyed artifact storage. At most one record per hash;
/// rewrites replace in place.
pub trait ArtifactCache: Send + Sync {
    fn get(&self, hash: &str) -> Option<ArtifactRecord>;
    fn put(&self, hash: &str, record: &ArtifactRecord);
    fn clear(&self);
}

/// Representation of a directory that contains built artifacts: a
/// `<hash>.wasm` per record with a `<hash>.json` metadata sidecar.
#[derive(Debug, Clone)]
pub struct FileSystemArtifactCache {
    path: PathBuf,
}

impl FileSystemArtifactCache {
    pub fn new<P: Into<PathBuf>>(path: P) -> io::Result<Self> {
        let path: PathBuf = path.into();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        } else if !path.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "the supplied path already points to a file: {}",
                    path.display()
                ),
            ));
        }
        Ok(Self { path })
    }
}

impl ArtifactCache for FileSystemArtifactCache {
    fn get(&self, hash: &str) -> Option<ArtifactRecord> {
        let wasm = match fs::read(self.path.join(format!("{hash}.wasm"))) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(hash, error = %e, "artifact read failed, treating as miss");
                return None;
            }
        };
        let metadata = match fs::read(self.path.join(format!("{hash}.json")))
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_slice(&raw).map_err(|e| e.to_string()))
        {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(hash, error = %e, "artifact metadata unreadable, treating as miss");
                return None;
            }
        };
        Some(ArtifactRecord { wasm, metadata })
    }

    fn put(&self, hash: &str, record: &ArtifactRecord) {
        let result = fs::write(self.path.join(format!("{hash}.wasm")), &record.wasm).and_then(
            |()| {
                let metadata =
                    serde_json::to_vec_pretty(&record.metadata).expect("metadata serializes");
                fs::write(self.path.join(format!("{hash}.json")), metadata)
            },
        );
        if let Err(e) = result {
            tracing::warn!(hash, error = %e, "artifact write failed, continuing without cache");
        }
    }

    fn clear(&self) {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "artifact cache clear failed");
                return;
            }
        };
        for entry in entries.flatten() {
            let keep = entry
                .path()
                .extension()
                .map(|ext| ext != "wasm" && ext != "json")
                .unwrap_or(true);
            if !keep {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// In-memory cache for tests and cache-less embedding.
#[derive(Debug, Default)]
pub struct MemoryArtifactCache {
    records: Mutex<HashMap<String, ArtifactRecord>>,
}

impl MemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactCache for MemoryArtifactCache {
    fn get(&self, hash: &str) -> Option<ArtifactRecord> {
        self.records.lock().unwrap().get(hash).cloned()
    }

    fn put(&self, hash: &str, record: &ArtifactRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(hash.to_string(), record.clone());
    }

    fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}
