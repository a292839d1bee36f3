use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// nixtui - NixOS installation orchestrator
#[derive(Parser, Debug)]
#[command(name = "nixtui")]
#[command(about = "Plan, validate and run NixOS installations")]
#[command(version)]
pub struct Cli {
    /// Installer settings file (default: /etc/nixtui/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: log every command instead of executing it.
    ///
    /// Filesystem writes, mount point creation and the build artifact check
    /// are skipped as well. Hardware scanning still runs so the plan is real.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report block devices, network interfaces and firmware mode
    Scan {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Walk an answers file through every stage validator without side effects
    Validate {
        /// Path to the answers file
        answers: PathBuf,
    },
    /// Install NixOS from an answers file
    Install {
        /// Path to the answers file
        #[arg(short, long)]
        plan: PathBuf,

        /// Confirm that all data on the target disk will be erased
        #[arg(short, long)]
        yes: bool,
    },
    /// Summarize a session journal after the fact
    Journal {
        /// Path to a nixtui-session-*.jsonl file
        path: PathBuf,
    },
    /// Write a commented default settings file
    InitConfig {
        /// Destination (default: /etc/nixtui/config.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
