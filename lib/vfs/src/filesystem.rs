//! The in-memory filesystem itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::path;
use crate::{VfsError, VfsResult};

/// File content as it was written: either text or raw bytes.
///
/// Whatever was stored is preserved; byte access converts text lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Bytes(Bytes),
}

impl FileContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }

    /// The content as a cheaply-cloneable byte buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Self::Bytes(b) => b.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for FileContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for FileContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for FileContent {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

/// Aggregate counters over the filesystem, O(files).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfsStats {
    pub file_count: usize,
    pub dir_count: usize,
    /// How many files carry the `.go` extension. Informational.
    pub source_file_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug)]
struct VfsInner {
    files: BTreeMap<String, FileContent>,
    dirs: BTreeSet<String>,
    cwd: String,
}

impl VfsInner {
    fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: BTreeMap::new(),
            dirs,
            cwd: "/".to_string(),
        }
    }

    fn ensure_ancestors(&mut self, file_path: &str) {
        let mut current = file_path;
        while let Some(dir) = path::parent(current) {
            if !self.dirs.insert(dir.to_string()) {
                break;
            }
            current = dir;
        }
    }
}

/// The in-memory filesystem.
///
/// A `Vfs` is a light handle over shared state; cloning it yields another
/// handle onto the same files, directories and working directory.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<RwLock<VfsInner>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("Vfs")
            .field("files", &inner.files.len())
            .field("dirs", &inner.dirs.len())
            .field("cwd", &inner.cwd)
            .finish()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(VfsInner::new())),
        }
    }

    /// Resolve a possibly-relative path against the working directory into
    /// canonical form.
    pub fn resolve(&self, p: &str) -> String {
        let inner = self.inner.read().unwrap();
        path::resolve(&inner.cwd, p)
    }

    /// Store `content` at `path`, creating every missing ancestor directory.
    pub fn write_file(&self, p: &str, content: impl Into<FileContent>) {
        let mut inner = self.inner.write().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        let content = content.into();
        tracing::trace!(path = %canonical, len = content.len(), "vfs write");
        inner.ensure_ancestors(&canonical);
        inner.files.insert(canonical, content);
    }

    /// Read the content stored at `path`.
    pub fn read_file(&self, p: &str) -> VfsResult<FileContent> {
        let inner = self.inner.read().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        inner
            .files
            .get(&canonical)
            .cloned()
            .ok_or(VfsError::NotFound)
    }

    pub fn exists(&self, p: &str) -> bool {
        let inner = self.inner.read().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        inner.files.contains_key(&canonical) || inner.dirs.contains(&canonical)
    }

    pub fn is_file(&self, p: &str) -> bool {
        let inner = self.inner.read().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        inner.files.contains_key(&canonical)
    }

    pub fn is_directory(&self, p: &str) -> bool {
        let inner = self.inner.read().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        inner.dirs.contains(&canonical)
    }

    /// Add `path` to the directory set. Idempotent; ancestors are created.
    pub fn create_dir(&self, p: &str) {
        let mut inner = self.inner.write().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        if canonical != "/" {
            inner.dirs.insert(canonical.clone());
            inner.ensure_ancestors(&canonical);
        }
    }

    /// The sorted unique immediate children of `path`.
    pub fn read_dir(&self, p: &str) -> VfsResult<Vec<String>> {
        let inner = self.inner.read().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        if !inner.dirs.contains(&canonical) {
            if inner.files.contains_key(&canonical) {
                return Err(VfsError::NotADirectory);
            }
            return Err(VfsError::NotFound);
        }

        let mut children = BTreeSet::new();
        for file in inner.files.keys() {
            if let Some(name) = path::first_component_under(file, &canonical) {
                children.insert(name.to_string());
            }
        }
        for dir in inner.dirs.iter() {
            if let Some(name) = path::first_component_under(dir, &canonical) {
                children.insert(name.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    /// Remove the file at `path`. Parent directories stay.
    pub fn remove_file(&self, p: &str) -> VfsResult<()> {
        let mut inner = self.inner.write().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        if inner.dirs.contains(&canonical) {
            return Err(VfsError::IsADirectory);
        }
        tracing::trace!(path = %canonical, "vfs unlink");
        inner
            .files
            .remove(&canonical)
            .map(|_| ())
            .ok_or(VfsError::NotFound)
    }

    /// Remove the directory at `path`, which must exist and be empty.
    pub fn remove_dir(&self, p: &str) -> VfsResult<()> {
        let mut inner = self.inner.write().unwrap();
        let canonical = path::resolve(&inner.cwd, p);
        if canonical == "/" {
            return Err(VfsError::NotEmpty);
        }
        if !inner.dirs.contains(&canonical) {
            return Err(VfsError::NotFound);
        }
        let occupied = inner
            .files
            .keys()
            .any(|f| path::is_descendant_of(f, &canonical))
            || inner
                .dirs
                .iter()
                .any(|d| path::is_descendant_of(d, &canonical));
        if occupied {
            return Err(VfsError::NotEmpty);
        }
        inner.dirs.remove(&canonical);
        Ok(())
    }

    /// Rename a file or directory. Directory renames carry every descendant.
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let mut inner = self.inner.write().unwrap();
        let from = path::resolve(&inner.cwd, from);
        let to = path::resolve(&inner.cwd, to);
        if from == to {
            return Ok(());
        }

        if let Some(content) = inner.files.remove(&from) {
            inner.ensure_ancestors(&to);
            inner.files.insert(to, content);
            return Ok(());
        }

        if inner.dirs.contains(&from) {
            let moved_dirs: Vec<String> = inner
                .dirs
                .iter()
                .filter(|d| *d == &from || path::is_descendant_of(d, &from))
                .cloned()
                .collect();
            let moved_files: Vec<String> = inner
                .files
                .keys()
                .filter(|f| path::is_descendant_of(f, &from))
                .cloned()
                .collect();

            for dir in moved_dirs {
                inner.dirs.remove(&dir);
                let renamed = format!("{}{}", to, &dir[from.len()..]);
                inner.dirs.insert(renamed);
            }
            for file in moved_files {
                let content = inner.files.remove(&file).unwrap();
                let renamed = format!("{}{}", to, &file[from.len()..]);
                inner.files.insert(renamed, content);
            }
            inner.ensure_ancestors(&to);
            return Ok(());
        }

        Err(VfsError::NotFound)
    }

    pub fn cwd(&self) -> String {
        self.inner.read().unwrap().cwd.clone()
    }

    pub fn set_cwd(&self, p: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.cwd = path::resolve(&inner.cwd, p);
    }

    /// Drop every file and directory, re-seed `/`, reset the cwd.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        tracing::debug!(
            files = inner.files.len(),
            dirs = inner.dirs.len(),
            "vfs clear"
        );
        *inner = VfsInner::new();
    }

    pub fn stats(&self) -> VfsStats {
        let inner = self.inner.read().unwrap();
        let mut stats = VfsStats {
            file_count: inner.files.len(),
            dir_count: inner.dirs.len(),
            ..Default::default()
        };
        for (p, content) in inner.files.iter() {
            if p.ends_with(".go") {
                stats.source_file_count += 1;
            }
            stats.total_bytes += content.len() as u64;
        }
        stats
    }
}
