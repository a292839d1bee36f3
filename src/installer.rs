//! Headless installer
//!
//! Drives a session without a UI: an answers file is replayed through the
//! orchestrator stage by stage, then the frozen plan is handed to the
//! execution engine on its worker thread while this thread drains the event bus.

use crate::command_runner::CommandRunner;
use crate::config::InstallerSettings;
use crate::config_file::PlanFile;
use crate::engine::{CancelToken, ExecutionEngine, ExecutionOutcome, ExecutionStatus, SessionJournal};
use crate::error::{NixTuiError, Result};
use crate::events::{self, ProgressEvent};
use crate::hardware::HardwareSnapshot;
use crate::install_state::{AdvanceOutcome, Orchestrator, Stage};
use std::sync::Arc;
use tracing::{info, warn};

/// Replay `answers` until the session rests at Review.
///
/// Destructive operations are not confirmed; the caller decides.
pub fn prepare_session(
    snapshot: Arc<HardwareSnapshot>,
    answers: &PlanFile,
    settings: &InstallerSettings,
) -> Result<Orchestrator> {
    answers
        .validate()
        .map_err(|e| NixTuiError::validation(e.to_string()))?;

    let mut orchestrator = Orchestrator::new(snapshot, settings.policy());
    while orchestrator.stage() != Stage::Review {
        let stage = orchestrator.stage();
        for decision in answers.decisions_for(stage, &settings.defaults) {
            orchestrator.apply(decision)?;
        }
        match orchestrator.advance()? {
            AdvanceOutcome::Advanced(next) => info!(from = %stage, to = %next, "answers accepted"),
            AdvanceOutcome::Blocked(reasons) => return Err(NixTuiError::blocked(stage, &reasons)),
        }
    }
    Ok(orchestrator)
}

/// Leave Review and run the frozen plan to completion.
///
/// `on_event` sees every bus event in order. The orchestrator ends in
/// Completed, Failed or Aborted.
pub fn run_installation(
    orchestrator: &mut Orchestrator,
    settings: &InstallerSettings,
    runner: Box<dyn CommandRunner>,
    cancel: CancelToken,
    mut on_event: impl FnMut(&ProgressEvent),
) -> Result<ExecutionOutcome> {
    // The journal must exist before anything touches the disk
    let journal = SessionJournal::create(&settings.journal_dir)?;

    match orchestrator.advance()? {
        AdvanceOutcome::Advanced(Stage::Executing) => {}
        AdvanceOutcome::Advanced(stage) => {
            return Err(NixTuiError::system(format!(
                "expected to enter Executing, entered {}",
                stage
            )));
        }
        AdvanceOutcome::Blocked(reasons) => {
            return Err(NixTuiError::blocked(orchestrator.stage(), &reasons));
        }
    }

    let Some(plan) = orchestrator.frozen_plan().cloned() else {
        orchestrator.record_execution_outcome(ExecutionStatus::Failed)?;
        return Err(NixTuiError::system("no frozen plan after leaving Review"));
    };
    info!(journal = %journal.path().display(), "plan frozen, starting engine");

    let (tx, rx) = events::channel();
    let engine = ExecutionEngine::new(plan, settings.engine_settings(), runner, tx, cancel)
        .with_journal(journal);
    let handle = match engine.spawn() {
        Ok(handle) => handle,
        Err(e) => {
            orchestrator.record_execution_outcome(ExecutionStatus::Failed)?;
            return Err(e.into());
        }
    };

    for event in rx.iter() {
        on_event(&event);
    }

    let outcome = match handle.join() {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("installation engine thread panicked");
            orchestrator.record_execution_outcome(ExecutionStatus::Failed)?;
            return Err(NixTuiError::system("installation engine thread panicked"));
        }
    };
    let stage = orchestrator.record_execution_outcome(outcome.status)?;
    info!(stage = %stage, "session finished");
    Ok(outcome)
}

/// One display line per event, `None` for events that need no output.
pub fn describe_event(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::Started { total_steps, .. } => {
            Some(format!("==> Installing ({} steps)", total_steps))
        }
        ProgressEvent::Transition(t) => Some(format!("==> {}", t)),
        ProgressEvent::Log { line, .. } => Some(format!("    {}", line)),
        ProgressEvent::CancellationRequested { at_step } => Some(format!(
            "==> Cancellation requested, rolling back before step {}",
            at_step + 1
        )),
        ProgressEvent::ManualInterventionRequired(m) => Some(format!("!!! {}", m)),
        ProgressEvent::Finished(outcome) => Some(format!("==> {}", outcome)),
    }
}
