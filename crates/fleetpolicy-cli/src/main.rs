use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod completion;
mod config;
mod dispatch;
mod logging;
mod render;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "fleetpolicy")]
#[command(about = "Keep managed package policies in step with installed packages", long_about = None)]
struct Cli {
    /// State directory holding installations, policies and package templates.
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,
    /// Worker threads used to evaluate policies; overrides config.toml.
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade managed policies whose package has a newer installed version.
    Upgrade {
        ids: Vec<String>,
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Report whether one policy is eligible for an upgrade.
    Check { id: String },
    List,
    /// Turn automatic policy upgrades on or off for an installed package.
    KeepUpToDate { package: String, state: Toggle },
    Doctor {
        /// Release a failed or abandoned bulk upgrade so new commits can start.
        #[arg(long)]
        release_failed: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;
    dispatch::run_cli(cli)
}
