//! The toolchain pack: fetching, durable caching and bit-exact parsing of
//! the binary container that carries the foreign compiler, the foreign
//! linker and the pre-built stdlib archives.

use thiserror::Error;

pub mod fetch;
pub mod format;
pub mod store;

pub use fetch::{fetch_pack, load_pack};
pub use format::{archive_dir, Pack, PackBuilder, ARCH_TARGET, PACK_MAGIC, PACK_VERSION};
pub use store::{FileSystemStore, MemoryStore, PackStore};

pub type PackResult<T> = std::result::Result<T, PackError>;

#[derive(Error, Debug)]
pub enum PackError {
    /// The pack could not be fetched over the network.
    #[error("network failure fetching pack: {0}")]
    Network(String),
    /// The pack header, a section length or an index entry is invalid.
    #[error("malformed pack: {0}")]
    Format(String),
    /// The pack could not be read from disk.
    #[error("i/o error reading pack")]
    Io(#[from] std::io::Error),
}
