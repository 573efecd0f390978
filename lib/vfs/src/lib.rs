//! In-memory filesystem for the goscript toolchain host.
//!
//! The foreign compiler and linker expect a POSIX-shaped filesystem; this
//! crate provides the store behind it: [`Vfs`] maps normalized absolute
//! paths to file content and tracks a directory set and working directory,
//! [`FsOps`] layers descriptors and the open/read/write/stat surface on
//! top, and [`stdio`] carries the sinks that receive writes to the
//! reserved descriptors 1 and 2.

use thiserror::Error;

pub mod fd;
mod filesystem;
mod ops;
pub mod path;
pub mod stdio;

pub use fd::{FdEntry, FdTable, FD_FLOOR, STDERR_FD, STDIN_FD, STDOUT_FD};
pub use filesystem::{FileContent, Vfs, VfsStats};
pub use ops::{FileStat, FsOps, DIR_MODE, FILE_MODE};
pub use stdio::{CaptureBuffer, CaptureSink, HostStderr, HostStdout, NullSink, OutputSink, SharedSink};

pub type VfsResult<T> = std::result::Result<T, VfsError>;

/// Error type for filesystem operations.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum VfsError {
    /// The requested file or directory could not be found
    #[error("entry not found")]
    NotFound,
    /// The descriptor is not open
    #[error("bad file descriptor")]
    BadFd,
    /// File exists
    #[error("file exists")]
    AlreadyExists,
    /// Expected a directory but found a file
    #[error("not a directory")]
    NotADirectory,
    /// Expected a file but found a directory
    #[error("is a directory")]
    IsADirectory,
    /// The directory is not empty
    #[error("directory not empty")]
    NotEmpty,
}

impl VfsError {
    /// The errno name the foreign modules match on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "ENOENT",
            Self::BadFd => "EBADF",
            Self::AlreadyExists => "EEXIST",
            Self::NotADirectory => "ENOTDIR",
            Self::IsADirectory => "EISDIR",
            Self::NotEmpty => "ENOTEMPTY",
        }
    }
}
