//! Kernel generation executable for kernelvault.

use anyhow::Result;
use clap::Parser;
use kernelvault_compiler::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
