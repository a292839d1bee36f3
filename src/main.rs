//! nixtui - Main entry point
//!
//! Exit status: 0 on success, 1 on failure, 130 when an installation was
//! cancelled and rolled back.

use anyhow::{Context, Result, bail};
use clap::Parser;
use nixtui::cli::{Cli, Commands};
use nixtui::command_runner::{CommandRunner, DryRunRunner, SystemRunner};
use nixtui::config::{self, DEFAULT_CONFIG_PATH, InstallerSettings};
use nixtui::config_file::PlanFile;
use nixtui::engine::{CancelToken, JournalSummary, read_journal};
use nixtui::hardware::{self, ScanReport};
use nixtui::install_state::Stage;
use nixtui::installer::{self, describe_event};
use nixtui::process_guard::{self, ProcessGuard};
use nixtui::sanity;
use nixtui::types::Filesystem;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Log to stderr; stdout carries reports and progress.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(?cli, "arguments parsed");

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::InitConfig { output, force } => {
            let path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            config::write_default(&path, force)?;
            println!("✓ Wrote default settings to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Journal { path } => {
            let records = read_journal(&path)?;
            let summary = JournalSummary::from_records(&records);
            println!("{}", summary);
            let completed = summary.outcome.as_ref().is_some_and(|o| o.is_success());
            Ok(if completed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Scan { json } => {
            let report = scan_hardware()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*report.snapshot)?);
            } else {
                println!("{}", report.snapshot.summary());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { answers } => {
            let settings = InstallerSettings::load(cli.config.as_deref())?;
            let answers = PlanFile::load_from_file(&answers)?;
            let report = scan_hardware()?;
            let orchestrator = installer::prepare_session(report.snapshot, &answers, &settings)?;
            let plan = orchestrator.plan().freeze()?;
            println!("{}", plan.summary());
            println!("✓ Answers file passes every stage");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Install { plan, yes } => install(cli.config, cli.dry_run, plan, yes),
    }
}

fn scan_hardware() -> Result<ScanReport> {
    let report = hardware::scan().context("Hardware scan failed")?;
    if let Some(partial) = &report.partial {
        warn!("{}", partial);
    }
    Ok(report)
}

fn install(config: Option<PathBuf>, dry_run: bool, plan: PathBuf, yes: bool) -> Result<ExitCode> {
    let settings = InstallerSettings::load(config.as_deref())?;
    let answers = PlanFile::load_from_file(&plan)?;
    let report = scan_hardware()?;

    let mut orchestrator = installer::prepare_session(report.snapshot, &answers, &settings)?;
    let preview = orchestrator.plan().freeze()?;
    println!("{}", preview.summary());

    if dry_run {
        info!("dry-run: commands are logged, nothing is written");
    } else {
        let filesystems: Vec<Filesystem> = preview.partitions.iter().map(|p| p.filesystem).collect();
        sanity::run_preflight_checks(&filesystems, false).map_err(anyhow::Error::msg)?;
        if !yes {
            bail!(
                "Refusing to erase {} without --yes",
                preview.device_id
            );
        }
    }
    orchestrator.confirm_destructive_operations()?;

    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let runner: Box<dyn CommandRunner> = if dry_run {
        Box::new(DryRunRunner::new())
    } else {
        Box::new(SystemRunner)
    };
    let outcome = installer::run_installation(&mut orchestrator, &settings, runner, cancel, |event| {
        if let Some(line) = describe_event(event) {
            println!("{}", line);
        }
    })?;

    if let Some(failure) = &outcome.failed_step {
        if !failure.diagnostic.is_empty() {
            eprintln!("--- output of '{}' ---\n{}", failure.step, failure.diagnostic);
        }
    }

    Ok(match orchestrator.stage() {
        Stage::Completed => ExitCode::SUCCESS,
        Stage::Aborted => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}
