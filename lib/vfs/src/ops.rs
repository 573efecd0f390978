//! Typed filesystem operations.
//!
//! The foreign toolchain speaks a callback-shaped POSIX surface; this
//! module is the same surface expressed as operations returning `Result`,
//! so the core stays testable without continuation plumbing. The ABI layer
//! adapts these into the callback protocol at the import boundary.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::fd::{constants, FdEntry, FdTable, STDERR_FD, STDIN_FD, STDOUT_FD};
use crate::stdio::{NullSink, SharedSink};
use crate::{Vfs, VfsError, VfsResult};

/// Stat attributes, mirroring what the foreign binaries read. Identity
/// attributes carry plausible fixed values; times are now-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_file: bool,
    pub is_directory: bool,
    pub mode: u32,
    pub size: u64,
    pub dev: u32,
    pub ino: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub blocks: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
}

pub const FILE_MODE: u32 = 0o666;
pub const DIR_MODE: u32 = 0o40777;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl FileStat {
    fn file(size: u64) -> Self {
        let now = now_ms();
        Self {
            is_file: true,
            is_directory: false,
            mode: FILE_MODE,
            size,
            dev: 1,
            ino: 1,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
        }
    }

    fn directory() -> Self {
        Self {
            is_file: false,
            is_directory: true,
            mode: DIR_MODE,
            ..Self::file(0)
        }
    }
}

/// The filesystem operations backing one foreign-module invocation: a
/// handle onto the shared [`Vfs`], a private descriptor table, and the
/// sinks receiving fds 1/2.
#[derive(Debug)]
pub struct FsOps {
    vfs: Vfs,
    fds: FdTable,
    stdout: SharedSink,
    stderr: SharedSink,
}

impl FsOps {
    pub fn new(vfs: Vfs) -> Self {
        Self {
            vfs,
            fds: FdTable::new(),
            stdout: SharedSink::new(NullSink),
            stderr: SharedSink::new(NullSink),
        }
    }

    pub fn with_stdout(mut self, sink: SharedSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_stderr(mut self, sink: SharedSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Open `path` and allocate a fresh descriptor.
    pub fn open(&mut self, path: &str, flags: u32, _mode: u32) -> VfsResult<u32> {
        let canonical = self.vfs.resolve(path);
        tracing::trace!(path = %canonical, flags, "open");

        let entry = if self.vfs.is_file(&canonical) {
            if flags & constants::O_CREAT != 0 && flags & constants::O_EXCL != 0 {
                return Err(VfsError::AlreadyExists);
            }
            let mut content = self.vfs.read_file(&canonical)?.to_bytes().to_vec();
            if flags & constants::O_TRUNC != 0 {
                content.clear();
                self.vfs.write_file(&canonical, Vec::new());
            }
            FdEntry {
                path: canonical,
                flags,
                content,
                position: 0,
                is_directory: false,
            }
        } else if self.vfs.is_directory(&canonical) {
            FdEntry {
                path: canonical,
                flags,
                content: Vec::new(),
                position: 0,
                is_directory: true,
            }
        } else {
            if flags & constants::O_CREAT == 0 {
                return Err(VfsError::NotFound);
            }
            self.vfs.write_file(&canonical, Vec::new());
            FdEntry {
                path: canonical,
                flags,
                content: Vec::new(),
                position: 0,
                is_directory: false,
            }
        };

        Ok(self.fds.allocate(entry))
    }

    /// Read up to `len` bytes. An explicit `pos` reads there without moving
    /// the cursor; otherwise the cursor advances. Returns empty at EOF.
    pub fn read(&mut self, fd: u32, len: usize, pos: Option<u64>) -> VfsResult<Vec<u8>> {
        let entry = self.fds.get_mut(fd).ok_or(VfsError::BadFd)?;
        let start = pos.unwrap_or(entry.position) as usize;
        if start >= entry.content.len() {
            return Ok(Vec::new());
        }
        let end = (start + len).min(entry.content.len());
        let data = entry.content[start..end].to_vec();
        if pos.is_none() {
            entry.position = end as u64;
        }
        Ok(data)
    }

    /// Write `data`. An explicit `pos` writes there without moving the
    /// cursor and zero-fills any gap past EOF; otherwise the write lands at
    /// the cursor (or the end, under `O_APPEND`) and advances it. The
    /// mutated snapshot flushes through to the filesystem.
    pub fn write(&mut self, fd: u32, data: &[u8], pos: Option<u64>) -> VfsResult<usize> {
        if fd == STDOUT_FD {
            self.stdout.write_bytes(data);
            return Ok(data.len());
        }
        if fd == STDERR_FD {
            self.stderr.write_bytes(data);
            return Ok(data.len());
        }

        let entry = self.fds.get_mut(fd).ok_or(VfsError::BadFd)?;
        let target = match pos {
            Some(p) => p as usize,
            None if entry.has_flag(constants::O_APPEND) => entry.content.len(),
            None => entry.position as usize,
        };

        if target > entry.content.len() {
            entry.content.resize(target, 0);
        }
        let overlap = (entry.content.len() - target).min(data.len());
        entry.content[target..target + overlap].copy_from_slice(&data[..overlap]);
        entry.content.extend_from_slice(&data[overlap..]);

        if pos.is_none() {
            entry.position = (target + data.len()) as u64;
        }

        let flushed = entry.content.clone();
        let path = entry.path.clone();
        self.vfs.write_file(&path, flushed);
        Ok(data.len())
    }

    /// Synchronous write at the cursor; fds 1/2 route to the sinks.
    pub fn write_sync(&mut self, fd: u32, data: &[u8]) -> VfsResult<usize> {
        match fd {
            STDOUT_FD => {
                self.stdout.write_bytes(data);
                Ok(data.len())
            }
            STDERR_FD => {
                self.stderr.write_bytes(data);
                Ok(data.len())
            }
            _ => self.write(fd, data, None),
        }
    }

    /// Release a descriptor. Succeeds whether or not it was open.
    pub fn close(&mut self, fd: u32) -> VfsResult<()> {
        self.fds.remove(fd);
        Ok(())
    }

    pub fn stat(&self, path: &str) -> VfsResult<FileStat> {
        let canonical = self.vfs.resolve(path);
        if self.vfs.is_file(&canonical) {
            let len = self.vfs.read_file(&canonical)?.len() as u64;
            Ok(FileStat::file(len))
        } else if self.vfs.is_directory(&canonical) {
            Ok(FileStat::directory())
        } else {
            Err(VfsError::NotFound)
        }
    }

    /// Identical to [`stat`](Self::stat); there are no symlinks.
    pub fn lstat(&self, path: &str) -> VfsResult<FileStat> {
        self.stat(path)
    }

    pub fn fstat(&self, fd: u32) -> VfsResult<FileStat> {
        match fd {
            STDIN_FD | STDOUT_FD | STDERR_FD => Ok(FileStat::file(0)),
            _ => {
                let entry = self.fds.get(fd).ok_or(VfsError::BadFd)?;
                if entry.is_directory {
                    Ok(FileStat::directory())
                } else {
                    Ok(FileStat::file(entry.content.len() as u64))
                }
            }
        }
    }

    pub fn mkdir(&mut self, path: &str, _perm: u32) -> VfsResult<()> {
        self.vfs.create_dir(path);
        Ok(())
    }

    pub fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        self.vfs.read_dir(path)
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.vfs.remove_file(path)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.vfs.rename(from, to)
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        self.vfs.remove_dir(path)
    }

    /// No-op; every write has already flushed through.
    pub fn fsync(&self, _fd: u32) -> VfsResult<()> {
        Ok(())
    }

    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let canonical = self.vfs.resolve(path);
        if !self.vfs.is_directory(&canonical) {
            return Err(VfsError::NotFound);
        }
        self.vfs.set_cwd(&canonical);
        Ok(())
    }

    pub fn cwd(&self) -> String {
        self.vfs.cwd()
    }

    pub fn open_fd_count(&self) -> usize {
        self.fds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::CaptureSink;
    use crate::fd::FD_FLOOR;
    use pretty_assertions::assert_eq;

    fn ops() -> FsOps {
        FsOps::new(Vfs::new())
    }

    #[test]
    fn open_missing_without_creat_fails() {
        let mut ops = ops();
        assert_eq!(ops.open("/x", constants::O_RDONLY, 0), Err(VfsError::NotFound));
    }

    #[test]
    fn open_creates_and_truncates() {
        let mut ops = ops();
        let fd = ops
            .open("/f", constants::O_WRONLY | constants::O_CREAT, 0o644)
            .unwrap();
        assert_eq!(fd, FD_FLOOR);
        ops.write(fd, b"hello", None).unwrap();
        ops.close(fd).unwrap();
        assert_eq!(ops.vfs().read_file("/f").unwrap().as_bytes(), b"hello");

        let fd = ops
            .open("/f", constants::O_WRONLY | constants::O_TRUNC, 0o644)
            .unwrap();
        assert_eq!(ops.vfs().read_file("/f").unwrap().len(), 0);
        ops.close(fd).unwrap();
    }

    #[test]
    fn exclusive_create_rejects_existing() {
        let mut ops = ops();
        ops.vfs().write_file("/f", "x");
        let flags = constants::O_WRONLY | constants::O_CREAT | constants::O_EXCL;
        assert_eq!(ops.open("/f", flags, 0), Err(VfsError::AlreadyExists));
    }

    #[test]
    fn fd_positions_are_independent() {
        let mut ops = ops();
        ops.vfs().write_file("/f", "abcdef");
        let a = ops.open("/f", constants::O_RDONLY, 0).unwrap();
        let b = ops.open("/f", constants::O_RDONLY, 0).unwrap();

        assert_eq!(ops.read(a, 3, None).unwrap(), b"abc");
        assert_eq!(ops.read(b, 2, None).unwrap(), b"ab");
        assert_eq!(ops.read(a, 3, None).unwrap(), b"def");
        assert_eq!(ops.read(a, 3, None).unwrap(), b"");
    }

    #[test]
    fn positional_read_does_not_advance() {
        let mut ops = ops();
        ops.vfs().write_file("/f", "abcdef");
        let fd = ops.open("/f", constants::O_RDONLY, 0).unwrap();

        assert_eq!(ops.read(fd, 2, Some(3)).unwrap(), b"de");
        assert_eq!(ops.read(fd, 2, None).unwrap(), b"ab");
    }

    #[test]
    fn positional_write_past_eof_zero_fills() {
        let mut ops = ops();
        let fd = ops
            .open("/f", constants::O_WRONLY | constants::O_CREAT, 0)
            .unwrap();
        ops.write(fd, b"ab", None).unwrap();
        ops.write(fd, b"z", Some(5)).unwrap();

        assert_eq!(
            ops.vfs().read_file("/f").unwrap().as_bytes(),
            &[b'a', b'b', 0, 0, 0, b'z']
        );
        // the cursor did not move
        ops.write(fd, b"c", None).unwrap();
        assert_eq!(
            ops.vfs().read_file("/f").unwrap().as_bytes(),
            &[b'a', b'b', b'c', 0, 0, b'z']
        );
    }

    #[test]
    fn append_writes_land_at_the_end() {
        let mut ops = ops();
        ops.vfs().write_file("/log", "one\n");
        let fd = ops
            .open("/log", constants::O_WRONLY | constants::O_APPEND, 0)
            .unwrap();
        ops.write(fd, b"two\n", None).unwrap();
        assert_eq!(ops.vfs().read_file("/log").unwrap().as_bytes(), b"one\ntwo\n");
    }

    #[test]
    fn write_sync_to_stdout_hits_the_sink() {
        let sink = CaptureSink::new();
        let buffer = sink.buffer();
        let mut ops = FsOps::new(Vfs::new()).with_stdout(SharedSink::new(sink));

        let n = ops.write_sync(1, b"hello\n").unwrap();
        assert_eq!(n, 6);
        assert_eq!(buffer.contents(), "hello\n");
        assert!(!ops.vfs().exists("/1"));
    }

    #[test]
    fn write_to_unknown_fd_is_bad_fd() {
        let mut ops = ops();
        assert_eq!(ops.write_sync(55, b"x"), Err(VfsError::BadFd));
        assert_eq!(ops.read(55, 1, None), Err(VfsError::BadFd));
    }

    #[test]
    fn close_succeeds_for_unknown_fds() {
        let mut ops = ops();
        ops.close(1234).unwrap();
    }

    #[test]
    fn stat_modes() {
        let mut ops = ops();
        ops.vfs().write_file("/f", "abc");
        ops.mkdir("/d", 0o777).unwrap();

        let f = ops.stat("/f").unwrap();
        assert!(f.is_file && !f.is_directory);
        assert_eq!(f.mode, 0o666);
        assert_eq!(f.size, 3);

        let d = ops.stat("/d").unwrap();
        assert!(d.is_directory && !d.is_file);
        assert_eq!(d.mode, 0o40777);

        assert_eq!(ops.stat("/nope"), Err(VfsError::NotFound));
        assert_eq!(ops.lstat("/f").unwrap().size, 3);
    }

    #[test]
    fn fstat_tracks_snapshot_length() {
        let mut ops = ops();
        let fd = ops
            .open("/f", constants::O_WRONLY | constants::O_CREAT, 0)
            .unwrap();
        ops.write(fd, b"12345", None).unwrap();
        assert_eq!(ops.fstat(fd).unwrap().size, 5);
        assert_eq!(ops.fstat(9999), Err(VfsError::BadFd));
    }

    #[test]
    fn chdir_requires_existing_directory() {
        let mut ops = ops();
        ops.mkdir("/work", 0).unwrap();
        ops.chdir("/work").unwrap();
        assert_eq!(ops.cwd(), "/work");
        assert_eq!(ops.chdir("/nope"), Err(VfsError::NotFound));
    }

    #[test]
    fn unlink_rename_rmdir_are_real() {
        let mut ops = ops();
        ops.vfs().write_file("/a/f", "x");
        ops.rename("/a/f", "/a/g").unwrap();
        assert!(ops.vfs().is_file("/a/g"));
        ops.unlink("/a/g").unwrap();
        assert!(!ops.vfs().exists("/a/g"));
        ops.rmdir("/a").unwrap();
        assert!(!ops.vfs().is_directory("/a"));
    }
}
