//! The `gosc` subcommands.

mod cache;
mod compile;
mod pack;
mod run;

pub use cache::Cache;
pub use compile::Compile;
pub use pack::PackCmd;
pub use run::Run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use goscript_driver::{Driver, DriverConfig, EventHandler, FileSystemArtifactCache};
use goscript_pack::FileSystemStore;

/// Where packs and artifacts persist across runs: `$GOSC_HOME`, else
/// `~/.goscript`.
pub fn host_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("GOSC_HOME") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".goscript"),
        None => PathBuf::from(".goscript"),
    }
}

/// Streams pipeline progress to stderr and program output to stdout.
#[derive(Debug, Default)]
struct CliEventHandler {
    quiet: bool,
}

impl EventHandler for CliEventHandler {
    fn progress(&mut self, pct: u8, message: &str) {
        if !self.quiet {
            eprintln!("[{pct:>3}%] {message}");
        }
    }

    fn output(&mut self, text: &str) {
        print!("{text}");
    }

    fn error(&mut self, message: &str) {
        eprintln!("error: {message}");
    }
}

pub(crate) fn build_driver(pack_url: &str, quiet: bool) -> Result<Driver> {
    let base = host_dir();
    let pack_store = FileSystemStore::new(base.join("packs"))
        .with_context(|| format!("preparing pack store under {}", base.display()))?;
    let artifact_cache = FileSystemArtifactCache::new(base.join("artifacts"))
        .with_context(|| format!("preparing artifact cache under {}", base.display()))?;

    let config = DriverConfig::new(pack_url)
        .pack_store(Arc::new(pack_store))
        .artifact_cache(Arc::new(artifact_cache))
        .event_handler(CliEventHandler { quiet });
    Ok(Driver::new(config))
}
