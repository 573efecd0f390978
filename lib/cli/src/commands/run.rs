use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;

use goscript_driver::{is_wasm, RunOptions};

use super::build_driver;

/// Compile (if needed) and execute a program.
#[derive(Debug, Parser)]
pub struct Run {
    /// A source file, or an already-built `.wasm` binary.
    file: PathBuf,

    /// Toolchain pack URL or path.
    #[clap(long, env = "GOSC_PACK")]
    pack: String,

    /// Suppress progress output.
    #[clap(short, long)]
    quiet: bool,

    /// Arguments passed through to the program.
    #[clap(last = true)]
    args: Vec<String>,
}

impl Run {
    /// Returns the guest's exit code.
    pub fn execute(self) -> Result<i32> {
        let raw = fs::read(&self.file).with_context(|| format!("reading {}", self.file.display()))?;
        let mut driver = build_driver(&self.pack, self.quiet)?;

        let wasm = if is_wasm(&raw) {
            Bytes::from(raw)
        } else {
            let source =
                String::from_utf8(raw).context("source file is neither wasm nor UTF-8 text")?;
            let outcome = driver.compile(source);
            match outcome.wasm {
                Some(wasm) => wasm,
                None => bail!(outcome
                    .error
                    .unwrap_or_else(|| "compilation failed".to_string())),
            }
        };

        let outcome = driver.run(
            &wasm,
            RunOptions {
                args: self.args,
                env: Default::default(),
            },
        );
        if let Some(error) = &outcome.error {
            if outcome.exit_code < 0 {
                bail!("{error}");
            }
        }
        Ok(outcome.exit_code)
    }
}
