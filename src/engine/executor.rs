//! Serialized step execution with best-effort rollback
//!
//! # Execution Model
//!
//! Steps run strictly one after another on the engine's worker thread. The
//! cancellation flag is read only at step boundaries: a running `mkfs` or
//! `nixos-install` is always allowed to finish.
//!
//! # Rollback Policy
//!
//! After a failure (or an observed cancellation) succeeded steps are visited in
//! strict reverse order:
//!
//! | Step state | Action |
//! |------------|--------|
//! | has an undo, no irreversible step above it | run the undo, mark `RolledBack` |
//! | destructive undo below an irreversible step | skip, report manual intervention |
//! | no undo | report manual intervention, raise the barrier |
//! | undo itself fails | report manual intervention, status stays `Succeeded` |
//!
//! The failing step itself is never undone. When it had already started a
//! disk-changing command (a wipe before `sgdisk`, a `mkfs` that died
//! mid-write) the partial state is reported as manual intervention.
//!
//! The engine never invents a repair for an irreversible step.

use crate::command_runner::{CommandRunner, CommandSpec, ToolOutput};
use crate::engine::actions::{
    ExecutionStep, StepAction, StepStatus, StepTransition, UndoAction, compile_actions,
    partition_table_args,
};
use crate::engine::journal::{JournalEntry, SessionJournal};
use crate::engine::{EngineSettings, nixgen};
use crate::events::{EventSender, ProgressEvent};
use crate::plan::FrozenPlan;
use crate::tool_args::ToolArgs;
use crate::tools::disk::{
    MkfsArgs, MountArgs, PartprobeArgs, SwapoffArgs, SwaponArgs, UnmountArgs, WipeSignaturesArgs,
};
use crate::tools::nixos::{GenerateConfigArgs, HookArgs, InstallBootloaderArgs, NixosInstallArgs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use strum::Display;
use thiserror::Error;
use tracing::{error, info, warn};

/// Cooperative cancellation flag shared between the signal handler, the UI and the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    /// Cancellation observed at a step boundary; rollback was attempted
    Cancelled,
}

/// A named step failed; `diagnostic` holds the tool's last output lines verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("step '{step}' failed: {message}")]
pub struct StepExecutionError {
    pub index: usize,
    pub step: String,
    pub message: String,
    pub diagnostic: String,
}

/// Partial state the engine could not (or must not) revert.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("manual intervention required for '{step}': {description}")]
pub struct ManualInterventionRequired {
    pub index: usize,
    pub step: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Indices of steps reverted, in the order they were reverted
    pub rolled_back: Vec<usize>,
    pub manual: Vec<ManualInterventionRequired>,
}

impl RollbackReport {
    /// Every succeeded step was reverted and nothing needs attention.
    pub fn is_clean(&self) -> bool {
        self.manual.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub label: String,
    pub status: StepStatus,
}

/// Final result of a run, delivered as the last bus event and journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// First (and only) failing step
    pub failed_step: Option<StepExecutionError>,
    pub rollback: Option<RollbackReport>,
    pub steps: Vec<StepSummary>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.failed_step) {
            (ExecutionStatus::Completed, _) => write!(f, "installation completed")?,
            (ExecutionStatus::Failed, Some(err)) => write!(f, "installation failed: {}", err)?,
            (ExecutionStatus::Failed, None) => write!(f, "installation failed")?,
            (ExecutionStatus::Cancelled, _) => write!(f, "installation cancelled")?,
        }
        if let Some(rollback) = &self.rollback {
            write!(
                f,
                "; rolled back {} step(s), {} item(s) need manual intervention",
                rollback.rolled_back.len(),
                rollback.manual.len()
            )?;
        }
        Ok(())
    }
}

/// Ordered, append-only record of step status transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionLog {
    entries: Vec<StepTransition>,
}

impl ExecutionLog {
    /// Append a transition and return the new length.
    pub fn append(&mut self, transition: StepTransition) -> usize {
        self.entries.push(transition);
        self.entries.len()
    }

    pub fn entries(&self) -> &[StepTransition] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs a frozen plan. Owns the only [`EventSender`].
pub struct ExecutionEngine {
    plan: FrozenPlan,
    settings: EngineSettings,
    runner: Box<dyn CommandRunner>,
    events: EventSender,
    cancel: CancelToken,
    journal: Option<SessionJournal>,
    steps: Vec<ExecutionStep>,
    log: ExecutionLog,
    outcome: Option<ExecutionOutcome>,
    /// Programs started by the step currently executing
    started: Vec<String>,
}

impl ExecutionEngine {
    pub fn new(
        plan: FrozenPlan,
        settings: EngineSettings,
        runner: Box<dyn CommandRunner>,
        events: EventSender,
        cancel: CancelToken,
    ) -> Self {
        let steps = compile_actions(&plan, &settings);
        Self {
            plan,
            settings,
            runner,
            events,
            cancel,
            journal: None,
            steps,
            log: ExecutionLog::default(),
            outcome: None,
            started: Vec::new(),
        }
    }

    /// Persist the plan and every transition to `journal`.
    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    pub fn plan(&self) -> &FrozenPlan {
        &self.plan
    }

    /// Run on a dedicated worker thread.
    pub fn spawn(mut self) -> io::Result<JoinHandle<ExecutionOutcome>> {
        thread::Builder::new()
            .name("install-engine".to_string())
            .spawn(move || self.run())
    }

    /// Execute every step, rolling back on failure or cancellation.
    ///
    /// A second call returns the first run's outcome without touching the system.
    pub fn run(&mut self) -> ExecutionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let labels: Vec<String> = self.steps.iter().map(|s| s.label.clone()).collect();
        info!(
            device = %self.plan.device_id,
            steps = labels.len(),
            dry_run = self.runner.is_dry_run(),
            "starting installation"
        );
        record(
            &mut self.journal,
            JournalEntry::Plan {
                plan: self.plan.snapshot().clone(),
                steps: labels.clone(),
            },
        );
        self.events.send(ProgressEvent::Started {
            total_steps: labels.len(),
            labels,
        });

        let mut failure: Option<StepExecutionError> = None;
        let mut cancelled = false;
        for index in 0..self.steps.len() {
            if self.cancel.is_cancelled() {
                warn!(at_step = index, "cancellation observed, stopping before next step");
                self.events
                    .send(ProgressEvent::CancellationRequested { at_step: index });
                cancelled = true;
                break;
            }

            self.set_status(index, StepStatus::Running);
            self.started.clear();
            let result = self.execute(index);
            match result {
                Ok(()) => {
                    self.steps[index].log.close();
                    self.set_status(index, StepStatus::Succeeded);
                }
                Err(err) => {
                    error!(step = %err.step, message = %err.message, "step failed");
                    self.emit_line(index, &format!("error: {}", err.message));
                    self.steps[index].log.close();
                    self.set_status(index, StepStatus::Failed);
                    failure = Some(err);
                    break;
                }
            }
        }

        let (status, rollback) = match (&failure, cancelled) {
            (Some(err), _) => (ExecutionStatus::Failed, Some(self.rollback(Some(err.index)))),
            (None, true) => (ExecutionStatus::Cancelled, Some(self.rollback(None))),
            (None, false) => (ExecutionStatus::Completed, None),
        };

        let outcome = ExecutionOutcome {
            status,
            failed_step: failure,
            rollback,
            steps: self
                .steps
                .iter()
                .map(|s| StepSummary {
                    index: s.index,
                    label: s.label.clone(),
                    status: s.status,
                })
                .collect(),
        };
        info!(status = %outcome.status, "{}", outcome);
        record(&mut self.journal, JournalEntry::Finished(outcome.clone()));
        self.events.send(ProgressEvent::Finished(outcome.clone()));
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn set_status(&mut self, index: usize, to: StepStatus) {
        let transition = self.steps[index].transition(to);
        info!(step = %transition.label, from = %transition.from, to = %transition.to, "step transition");
        self.log.append(transition.clone());
        record(&mut self.journal, JournalEntry::Transition(transition.clone()));
        self.events.send(ProgressEvent::Transition(transition));
    }

    /// Send a line to the step log, the bus and the journal.
    fn emit_line(&mut self, index: usize, line: &str) {
        self.steps[index].log.push(line);
        self.events.send(ProgressEvent::Log {
            index,
            line: line.to_string(),
        });
        record(
            &mut self.journal,
            JournalEntry::Log {
                index,
                line: line.to_string(),
            },
        );
    }

    fn fail(&self, index: usize, message: impl Into<String>) -> StepExecutionError {
        StepExecutionError {
            index,
            step: self.steps[index].label.clone(),
            message: message.into(),
            diagnostic: String::new(),
        }
    }

    /// Run one tool, streaming its output; non-zero exit is a step failure.
    fn run_tool(&mut self, index: usize, cmd: CommandSpec) -> Result<ToolOutput, StepExecutionError> {
        self.emit_line(index, &format!("$ {}", cmd));
        self.started.push(cmd.program.clone());

        let Self {
            runner,
            steps,
            events,
            journal,
            ..
        } = self;
        let step = &mut steps[index];
        let mut on_line = |line: &str| {
            step.log.push(line);
            events.send(ProgressEvent::Log {
                index,
                line: line.to_string(),
            });
            record(
                journal,
                JournalEntry::Log {
                    index,
                    line: line.to_string(),
                },
            );
        };

        match runner.run(&cmd, &mut on_line) {
            Ok(output) if output.success => Ok(output),
            Ok(output) => Err(StepExecutionError {
                index,
                step: step.label.clone(),
                message: format!("{} failed with {}", cmd.program, output.exit_description()),
                diagnostic: output.diagnostic(),
            }),
            Err(e) => Err(StepExecutionError {
                index,
                step: step.label.clone(),
                message: format!("could not run {}: {}", cmd.program, e),
                diagnostic: String::new(),
            }),
        }
    }

    fn execute(&mut self, index: usize) -> Result<(), StepExecutionError> {
        let action = self.steps[index].action.clone();
        let dry_run = self.runner.is_dry_run();

        match action {
            StepAction::PartitionDisk { disk } => {
                self.run_tool(index, WipeSignaturesArgs { device: disk.clone() }.to_command())?;
                self.run_tool(index, partition_table_args(&self.plan).to_command())?;
                self.run_tool(index, PartprobeArgs { disk }.to_command())?;
            }
            StepAction::FormatPartition {
                device,
                filesystem,
                label,
                ..
            } => {
                let args = MkfsArgs {
                    device,
                    filesystem,
                    label: Some(label),
                };
                self.run_tool(index, args.to_command())?;
            }
            StepAction::MountPartition { device, target, .. } => {
                if !dry_run {
                    fs::create_dir_all(&target).map_err(|e| {
                        self.fail(
                            index,
                            format!("could not create mount point {}: {}", target.display(), e),
                        )
                    })?;
                }
                self.run_tool(index, MountArgs { device, target }.to_command())?;
            }
            StepAction::ActivateSwap { device, .. } => {
                self.run_tool(index, SwaponArgs { device }.to_command())?;
            }
            StepAction::GenerateConfig { root, config_dir } => {
                let output = self.run_tool(index, GenerateConfigArgs { root }.to_command())?;
                let configuration = nixgen::render_configuration(&self.plan, &self.settings);
                if dry_run {
                    self.emit_line(
                        index,
                        &format!("[dry-run] would write configuration to {}", config_dir.display()),
                    );
                } else {
                    self.write_config(index, &config_dir, &output.stdout, &configuration)?;
                }
            }
            StepAction::RunHook { script, .. } => {
                let args = HookArgs {
                    script,
                    host_name: self.plan.identity.hostname.clone(),
                    disk: self.plan.device_id.clone(),
                    mount_root: self.settings.target_root.clone(),
                    config_dir: self.settings.config_dir(),
                };
                self.run_tool(index, args.to_command())?;
            }
            StepAction::BuildSystem { root } => {
                let args = NixosInstallArgs {
                    root,
                    no_channel_copy: self.settings.no_channel_copy,
                };
                self.run_tool(index, args.to_command())?;
                let profile = self.settings.system_profile();
                if !dry_run && !profile.exists() {
                    return Err(self.fail(
                        index,
                        format!(
                            "nixos-install exited successfully but {} is missing",
                            profile.display()
                        ),
                    ));
                }
            }
            StepAction::InstallBootloader { root, .. } => {
                self.run_tool(index, InstallBootloaderArgs { root }.to_command())?;
            }
        }
        Ok(())
    }

    fn write_config(
        &mut self,
        index: usize,
        config_dir: &Path,
        hardware: &str,
        configuration: &str,
    ) -> Result<(), StepExecutionError> {
        fs::create_dir_all(config_dir).map_err(|e| {
            self.fail(index, format!("could not create {}: {}", config_dir.display(), e))
        })?;
        for (name, contents) in [
            ("hardware-configuration.nix", hardware),
            ("configuration.nix", configuration),
        ] {
            let path = config_dir.join(name);
            fs::write(&path, contents)
                .map_err(|e| self.fail(index, format!("could not write {}: {}", path.display(), e)))?;
            self.emit_line(index, &format!("wrote {}", path.display()));
        }
        Ok(())
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    fn rollback(&mut self, failed: Option<usize>) -> RollbackReport {
        let mut report = RollbackReport::default();
        // Set once an irreversible step is passed; destructive undos below it stay put
        let mut barrier = false;

        let end = match failed {
            Some(index) => {
                if self.steps[index].undo.is_none() {
                    let description = format!(
                        "the step failed part-way and cannot be undone: {}",
                        self.steps[index].action.lasting_effect()
                    );
                    self.report_manual(&mut report, index, description);
                    barrier = true;
                } else if let Some(effect) = self.partial_effect(index) {
                    self.report_manual(&mut report, index, effect);
                }
                index
            }
            None => self.steps.len(),
        };

        info!(steps = end, "starting rollback");
        for index in (0..end).rev() {
            if self.steps[index].status != StepStatus::Succeeded {
                continue;
            }
            match self.steps[index].undo.clone() {
                None => {
                    let description = format!(
                        "cannot be undone: {}",
                        self.steps[index].action.lasting_effect()
                    );
                    self.report_manual(&mut report, index, description);
                    barrier = true;
                }
                Some(undo) if barrier && undo.is_destructive() => {
                    let description = format!(
                        "did not {} because a later irreversible step depends on it",
                        undo.describe()
                    );
                    self.report_manual(&mut report, index, description);
                }
                Some(undo) => match self.run_undo(index, &undo) {
                    Ok(()) => {
                        self.set_status(index, StepStatus::RolledBack);
                        report.rolled_back.push(index);
                    }
                    Err(message) => {
                        let description = format!("could not {}: {}", undo.describe(), message);
                        self.report_manual(&mut report, index, description);
                    }
                },
            }
        }

        info!(
            rolled_back = report.rolled_back.len(),
            manual = report.manual.len(),
            "rollback finished"
        );
        report
    }

    /// Disk state left by the failing step, once any of its commands had started.
    fn partial_effect(&self, index: usize) -> Option<String> {
        if self.started.is_empty() || self.runner.is_dry_run() {
            return None;
        }
        let effect = self.steps[index].action.partial_effect()?;
        Some(format!(
            "the step failed part-way after running {}: {}",
            self.started.join(", "),
            effect
        ))
    }

    fn report_manual(&mut self, report: &mut RollbackReport, index: usize, description: String) {
        let manual = ManualInterventionRequired {
            index,
            step: self.steps[index].label.clone(),
            description,
        };
        warn!(step = %manual.step, "{}", manual.description);
        record(
            &mut self.journal,
            JournalEntry::ManualIntervention(manual.clone()),
        );
        self.events
            .send(ProgressEvent::ManualInterventionRequired(manual.clone()));
        report.manual.push(manual);
    }

    fn run_undo(&mut self, index: usize, undo: &UndoAction) -> Result<(), String> {
        info!(step = %self.steps[index].label, undo = %undo.describe(), "rolling back");
        let cmd = match undo {
            UndoAction::WipePartitionTable { disk } => WipeSignaturesArgs { device: disk.clone() }.to_command(),
            UndoAction::WipeSignature { device } => WipeSignaturesArgs {
                device: device.clone(),
            }
            .to_command(),
            UndoAction::Unmount { target } => UnmountArgs {
                target: target.clone(),
            }
            .to_command(),
            UndoAction::DeactivateSwap { device } => SwapoffArgs {
                device: device.clone(),
            }
            .to_command(),
            UndoAction::RemoveGeneratedConfig { files } => return self.remove_files(index, files),
        };

        let Self {
            runner,
            events,
            journal,
            ..
        } = self;
        let mut on_line = |line: &str| {
            let line = format!("[rollback] {}", line);
            events.send(ProgressEvent::Log {
                index,
                line: line.clone(),
            });
            record(journal, JournalEntry::Log { index, line });
        };
        match runner.run(&cmd, &mut on_line) {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(format!(
                "{} failed with {}: {}",
                cmd.program,
                output.exit_description(),
                output.diagnostic()
            )),
            Err(e) => Err(format!("could not run {}: {}", cmd.program, e)),
        }
    }

    fn remove_files(&mut self, index: usize, files: &[std::path::PathBuf]) -> Result<(), String> {
        if self.runner.is_dry_run() {
            return Ok(());
        }
        for file in files {
            match fs::remove_file(file) {
                Ok(()) => {
                    let line = format!("[rollback] removed {}", file.display());
                    self.events.send(ProgressEvent::Log {
                        index,
                        line: line.clone(),
                    });
                    record(&mut self.journal, JournalEntry::Log { index, line });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(format!("{}: {}", file.display(), e)),
            }
        }
        Ok(())
    }
}

/// Append to the journal; a failing journal is reported once and then disabled.
fn record(journal: &mut Option<SessionJournal>, entry: JournalEntry) {
    if let Some(j) = journal {
        if let Err(e) = j.append(entry) {
            warn!(path = %j.path().display(), error = %e, "session journal write failed; journaling disabled");
            *journal = None;
        }
    }
}
