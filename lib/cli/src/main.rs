//! `gosc` — compile and run programs with the goscript toolchain pack.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{Cache, Compile, PackCmd, Run};

#[derive(Debug, Parser)]
#[clap(name = "gosc", version, about = "Host driver for the goscript wasm toolchain")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Compile(Compile),
    Run(Run),
    #[clap(name = "pack")]
    Pack(PackCmd),
    Cache(Cache),
}

fn main() {
    logging::set_up_logging();

    let exit_code = match execute(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn execute(args: Args) -> Result<i32> {
    match args.command {
        Command::Compile(cmd) => cmd.execute().map(|()| 0),
        Command::Run(cmd) => cmd.execute(),
        Command::Pack(cmd) => cmd.execute().map(|()| 0),
        Command::Cache(cmd) => cmd.execute().map(|()| 0),
    }
}
