#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

use clap::Parser;

mod run_cli;

#[derive(Parser)]
#[command(name = "openagents")]
#[command(about = "OpenAgents umbrella CLI")]
pub struct OpenAgentsCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Remote agent runs (start, loop, attach, cancel, list)
    Run(run_cli::RunArgs),
}

pub fn run() -> anyhow::Result<()> {
    let cli = OpenAgentsCli::parse();
    match cli.command {
        Commands::Run(args) => run_cli::run(args),
    }
}
