//! Treeward CLI: threat modeling with attack trees mapped to adversary techniques.
//!
//! Runs the resumable analysis workflow over a project, and manages the
//! technique graph cache and workflow checkpoints.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli)
}
