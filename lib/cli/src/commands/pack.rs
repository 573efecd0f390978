use anyhow::Result;
use clap::{Parser, Subcommand};

use goscript_pack::{load_pack, MemoryStore};

/// Inspect toolchain packs.
#[derive(Debug, Parser)]
pub struct PackCmd {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print the header summary and archive index of a pack.
    Info {
        /// Pack URL or path.
        pack: String,
    },
}

impl PackCmd {
    pub fn execute(self) -> Result<()> {
        match self.cmd {
            Cmd::Info { pack } => info(&pack),
        }
    }
}

fn info(url: &str) -> Result<()> {
    // inspection is one-shot, no need to persist the fetched bytes
    let pack = load_pack(url, &MemoryStore::new())?;

    println!("pack: {url}");
    println!("size: {} bytes", pack.size());
    println!("compiler: {} bytes", pack.compiler().len());
    println!("linker: {} bytes", pack.linker().len());
    println!("packages: {}", pack.package_count());
    for (name, size) in pack.entries() {
        println!("  {name:<28} {size:>10} bytes");
    }
    Ok(())
}
