use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use goscript_driver::SourceSet;

use super::build_driver;

/// Compile source files into a WebAssembly binary.
#[derive(Debug, Parser)]
pub struct Compile {
    /// Source files to compile.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Where to write the produced binary.
    #[clap(short = 'o', long, default_value = "main.wasm")]
    output: PathBuf,

    /// Toolchain pack URL or path.
    #[clap(long, env = "GOSC_PACK")]
    pack: String,

    /// Suppress progress output.
    #[clap(short, long)]
    quiet: bool,
}

impl Compile {
    pub fn execute(self) -> Result<()> {
        let mut sources = SourceSet::new();
        for file in &self.files {
            let content = fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "main.go".to_string());
            sources.insert(name, content);
        }

        let mut driver = build_driver(&self.pack, self.quiet)?;
        let outcome = driver.compile(sources);
        let Some(wasm) = outcome.wasm else {
            bail!(outcome
                .error
                .unwrap_or_else(|| "compilation failed".to_string()));
        };

        fs::write(&self.output, &wasm)
            .with_context(|| format!("writing {}", self.output.display()))?;
        if !self.quiet {
            eprintln!(
                "wrote {} ({} bytes, {:?}{})",
                self.output.display(),
                wasm.len(),
                outcome.metadata.compile_time,
                if outcome.metadata.cache_hit {
                    ", cached"
                } else {
                    ""
                },
            );
        }
        Ok(())
    }
}
