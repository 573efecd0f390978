use std::fs;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

use super::host_dir;

/// Manage the persistent pack and artifact caches.
#[derive(Debug, Parser)]
pub struct Cache {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Cmd {
    /// Clear the caches.
    Clean,
    /// Display the location of the caches.
    Dir,
}

impl Cache {
    pub fn execute(self) -> Result<()> {
        let dir = host_dir();
        match self.cmd {
            Cmd::Clean => clean(&dir),
            Cmd::Dir => {
                println!("{}", dir.display());
                Ok(())
            }
        }
    }
}

fn clean(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    eprintln!("cache cleaned successfully");
    Ok(())
}
