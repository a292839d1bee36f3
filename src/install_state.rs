//! Orchestration state machine
//!
//! This module is the single source of truth for session progress. The
//! [`Orchestrator`] exclusively owns the mutable [`InstallationPlan`] and the
//! current [`Stage`]; the execution engine only ever receives a [`FrozenPlan`].
//!
//! # Design Principles
//!
//! - **Atomic transitions**: `advance()` either moves exactly one stage forward or
//!   returns the blocking reasons with the stage unchanged
//! - **Validated edits**: every decision goes through a plan mutator; a rejected
//!   edit leaves the plan untouched
//! - **Execution is engine-driven**: once `Executing`, only the engine's outcome
//!   moves the stage
//!
//! # Stage Flow
//!
//! ```text
//! Welcome
//!     ↓
//! DiskSelection
//!     ↓
//! PartitionPlanning
//!     ↓
//! Identity
//!     ↓
//! UserSetup
//!     ↓
//! Review          (requires destructive confirmation)
//!     ↓
//! Executing
//!     ↓
//! Completed | Failed | Aborted
//!
//! (abort() from any stage before Executing returns to Welcome)
//! ```

use crate::engine::ExecutionStatus;
use crate::hardware::HardwareSnapshot;
use crate::plan::{
    FrozenPlan, InstallationPlan, PartitionId, PartitionSize, PartitionSpec, PlanConstraintViolation,
    SystemIdentity, UserSpec,
};
use crate::types::BootloaderTarget;
use crate::validator::{BlockReason, PlanField, ValidationPolicy, Verdict, can_advance};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session stages in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    Welcome = 0,
    DiskSelection = 1,
    PartitionPlanning = 2,
    Identity = 3,
    UserSetup = 4,
    /// Last chance to back out; leaving it starts destructive work
    Review = 5,
    Executing = 6,
    /// Installation finished successfully (terminal state)
    Completed = 7,
    /// A step failed; rollback was attempted (terminal state)
    Failed = 8,
    /// Cancelled during execution and rolled back (terminal state)
    Aborted = 9,
}

impl Stage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true for Completed, Failed and Aborted
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns true while the user is still making decisions
    #[inline]
    pub const fn is_pre_execution(self) -> bool {
        (self as u8) < (Self::Executing as u8)
    }

    /// Next stage reachable by `advance()`; `None` from Executing and terminal states
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Welcome => Some(Self::DiskSelection),
            Self::DiskSelection => Some(Self::PartitionPlanning),
            Self::PartitionPlanning => Some(Self::Identity),
            Self::Identity => Some(Self::UserSetup),
            Self::UserSetup => Some(Self::Review),
            Self::Review => Some(Self::Executing),
            Self::Executing | Self::Completed | Self::Failed | Self::Aborted => None,
        }
    }

    pub const fn previous(self) -> Option<Self> {
        match self {
            Self::DiskSelection => Some(Self::Welcome),
            Self::PartitionPlanning => Some(Self::DiskSelection),
            Self::Identity => Some(Self::PartitionPlanning),
            Self::UserSetup => Some(Self::Identity),
            Self::Review => Some(Self::UserSetup),
            Self::Welcome
            | Self::Executing
            | Self::Completed
            | Self::Failed
            | Self::Aborted => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Welcome => "Welcome",
            Self::DiskSelection => "Disk selection",
            Self::PartitionPlanning => "Partition planning",
            Self::Identity => "System identity",
            Self::UserSetup => "User setup",
            Self::Review => "Review",
            Self::Executing => "Installing",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
            Self::Aborted => "Installation aborted",
        }
    }

    /// Guided stages in order (excluding Executing and terminal states)
    pub const fn decision_stages() -> &'static [Self] {
        &[
            Self::Welcome,
            Self::DiskSelection,
            Self::PartitionPlanning,
            Self::Identity,
            Self::UserSetup,
            Self::Review,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Misuse of the state machine by the driving layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTransitionError {
    /// Attempted to leave a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: Stage },

    /// Attempted a user-driven operation while the engine owns the session
    #[error("Cannot {operation} while the installation is executing")]
    DuringExecution { operation: &'static str },

    /// Attempted to record an execution outcome outside of Executing
    #[error("Cannot record an execution outcome at stage {stage}")]
    NotExecuting { stage: Stage },
}

/// Error from applying a user decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error(transparent)]
    Transition(#[from] InvalidTransitionError),

    #[error(transparent)]
    Constraint(#[from] PlanConstraintViolation),
}

/// Result of a successful `advance()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to the contained stage
    Advanced(Stage),
    /// Stage unchanged; reasons in order
    Blocked(Vec<BlockReason>),
}

impl AdvanceOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced(_))
    }
}

/// A field edit coming from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    SelectDevice { device: String },
    /// Replace the layout with the standard full-disk layout
    UseDefaultLayout { swap_gib: Option<u64> },
    AddPartition { spec: PartitionSpec },
    RemovePartition { id: PartitionId },
    ResizePartition { id: PartitionId, size: PartitionSize },
    SetIdentity { identity: SystemIdentity },
    AddUser { user: UserSpec },
    RemoveUser { name: String },
    /// crypt(3) hash for root; `None` keeps root locked
    SetRootPassword { hash: Option<String> },
    SetBootloader { target: BootloaderTarget, confirmed: bool },
    WaiveAdminRequirement { waived: bool },
}

/// Everything the presentation layer sends into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRequest {
    Edit(Decision),
    Advance,
    Back,
    Abort,
    ConfirmDestructive,
}

/// What the presentation layer renders after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub stage: Stage,
    pub plan: InstallationPlan,
    /// Feedback for leaving the current stage
    pub verdict: Verdict,
    pub destructive_confirmed: bool,
    pub snapshot_generation: u64,
}

/// Session owner: current stage, mutable plan, hardware snapshot.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    stage: Stage,
    plan: InstallationPlan,
    snapshot: Arc<HardwareSnapshot>,
    policy: ValidationPolicy,
    /// Set when leaving Review; handed to the execution engine
    frozen: Option<FrozenPlan>,
    destructive_confirmed: bool,
    /// Stage entries with unix timestamps
    stage_history: Vec<(Stage, u64)>,
}

impl Orchestrator {
    pub fn new(snapshot: Arc<HardwareSnapshot>, policy: ValidationPolicy) -> Self {
        let plan = InstallationPlan::for_snapshot(&snapshot);
        let mut orchestrator = Self {
            stage: Stage::Welcome,
            plan,
            snapshot,
            policy,
            frozen: None,
            destructive_confirmed: false,
            stage_history: Vec::with_capacity(Stage::decision_stages().len() + 2),
        };
        orchestrator.record_stage_transition(Stage::Welcome);
        orchestrator
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[inline]
    pub fn plan(&self) -> &InstallationPlan {
        &self.plan
    }

    pub fn snapshot(&self) -> &Arc<HardwareSnapshot> {
        &self.snapshot
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// The plan frozen when the session left Review.
    pub fn frozen_plan(&self) -> Option<&FrozenPlan> {
        self.frozen.as_ref()
    }

    pub fn stage_history(&self) -> &[(Stage, u64)] {
        &self.stage_history
    }

    #[inline]
    pub fn is_destructive_confirmed(&self) -> bool {
        self.destructive_confirmed
    }

    /// Authorize the destructive operations the reviewed plan implies.
    ///
    /// Any later edit or `go_back()` revokes the confirmation.
    pub fn confirm_destructive_operations(&mut self) -> Result<(), InvalidTransitionError> {
        self.ensure_pre_execution("confirm destructive operations")?;
        self.destructive_confirmed = true;
        Ok(())
    }

    /// Feedback for leaving the current stage, including the confirmation gate.
    pub fn validate_current(&self) -> Verdict {
        let verdict = can_advance(self.stage, &self.plan, &self.snapshot, &self.policy);
        if self.stage != Stage::Review || self.destructive_confirmed {
            return verdict;
        }

        let mut reasons = verdict.reasons().to_vec();
        let device = self
            .plan
            .target_device()
            .map(|d| d.id.as_str())
            .unwrap_or("the target disk");
        reasons.push(BlockReason::new(
            PlanField::Confirmation,
            format!("confirm that all data on {} will be erased", device),
        ));
        Verdict::Blocked(reasons)
    }

    /// Move one stage forward if the validators allow it.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Completed, Failed or Aborted
    /// - `DuringExecution` if the engine owns the session
    pub fn advance(&mut self) -> Result<AdvanceOutcome, InvalidTransitionError> {
        self.ensure_pre_execution("advance")?;

        if let Verdict::Blocked(reasons) = self.validate_current() {
            debug!(stage = %self.stage, blocked = reasons.len(), "advance blocked");
            return Ok(AdvanceOutcome::Blocked(reasons));
        }

        let Some(next) = self.stage.next() else {
            return Err(InvalidTransitionError::FromTerminalState { from: self.stage });
        };

        if next == Stage::Executing {
            match self.plan.freeze() {
                Ok(frozen) => self.frozen = Some(frozen),
                Err(e) => {
                    warn!(error = %e, "plan passed review but failed to freeze");
                    return Ok(AdvanceOutcome::Blocked(vec![BlockReason::new(
                        PlanField::Stage,
                        e.to_string(),
                    )]));
                }
            }
        }

        info!(from = %self.stage, to = %next, "stage advanced");
        self.record_stage_transition(next);
        self.stage = next;
        Ok(AdvanceOutcome::Advanced(next))
    }

    /// Move one stage back. Never re-validates; a no-op at Welcome.
    pub fn go_back(&mut self) -> Result<Stage, InvalidTransitionError> {
        self.ensure_pre_execution("go back")?;
        if let Some(previous) = self.stage.previous() {
            debug!(from = %self.stage, to = %previous, "stage retreated");
            self.destructive_confirmed = false;
            self.record_stage_transition(previous);
            self.stage = previous;
        }
        Ok(self.stage)
    }

    /// Discard the in-progress plan and return to Welcome.
    pub fn abort(&mut self) -> Result<Stage, InvalidTransitionError> {
        self.ensure_pre_execution("abort")?;
        info!(from = %self.stage, "session aborted, plan discarded");
        self.plan = InstallationPlan::for_snapshot(&self.snapshot);
        self.frozen = None;
        self.destructive_confirmed = false;
        self.record_stage_transition(Stage::Welcome);
        self.stage = Stage::Welcome;
        Ok(self.stage)
    }

    /// Apply one user decision through the plan's validated mutators.
    pub fn apply(&mut self, decision: Decision) -> Result<(), DecisionError> {
        self.ensure_pre_execution("edit the plan")?;
        match decision {
            Decision::SelectDevice { device } => {
                self.plan.set_target_device(&self.snapshot, &device)?;
            }
            Decision::UseDefaultLayout { swap_gib } => {
                let layout = InstallationPlan::default_layout(self.plan.bootloader_target(), swap_gib);
                self.plan.replace_layout(layout)?;
            }
            Decision::AddPartition { spec } => {
                self.plan.add_partition(spec)?;
            }
            Decision::RemovePartition { id } => {
                self.plan.remove_partition(id)?;
            }
            Decision::ResizePartition { id, size } => self.plan.resize_partition(id, size)?,
            Decision::SetIdentity { identity } => self.plan.set_identity(identity)?,
            Decision::AddUser { user } => self.plan.add_user(user)?,
            Decision::RemoveUser { name } => {
                self.plan.remove_user(&name)?;
            }
            Decision::SetRootPassword { hash } => self.plan.set_root_password_hash(hash)?,
            Decision::SetBootloader { target, confirmed } => {
                self.plan.set_bootloader_target(target, confirmed)?;
            }
            Decision::WaiveAdminRequirement { waived } => self.plan.set_admin_waiver(waived)?,
        }
        self.destructive_confirmed = false;
        Ok(())
    }

    /// Single entry point for presentation-layer events.
    pub fn dispatch(&mut self, request: UserRequest) -> Result<SessionView, DecisionError> {
        match request {
            UserRequest::Edit(decision) => self.apply(decision)?,
            UserRequest::Advance => {
                self.advance()?;
            }
            UserRequest::Back => {
                self.go_back()?;
            }
            UserRequest::Abort => {
                self.abort()?;
            }
            UserRequest::ConfirmDestructive => self.confirm_destructive_operations()?,
        }
        Ok(self.view())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            stage: self.stage,
            plan: self.plan.clone(),
            verdict: self.validate_current(),
            destructive_confirmed: self.destructive_confirmed,
            snapshot_generation: self.snapshot.generation,
        }
    }

    /// Swap in a fresh hardware snapshot. The plan is kept and re-validated on the next advance.
    pub fn replace_snapshot(&mut self, snapshot: Arc<HardwareSnapshot>) -> Result<(), InvalidTransitionError> {
        self.ensure_pre_execution("replace the hardware snapshot")?;
        info!(
            old = self.snapshot.generation,
            new = snapshot.generation,
            "hardware snapshot replaced"
        );
        self.snapshot = snapshot;
        Ok(())
    }

    /// Move out of Executing once the engine reports its outcome.
    pub fn record_execution_outcome(&mut self, status: ExecutionStatus) -> Result<Stage, InvalidTransitionError> {
        if self.stage != Stage::Executing {
            return Err(InvalidTransitionError::NotExecuting { stage: self.stage });
        }
        let terminal = match status {
            ExecutionStatus::Completed => Stage::Completed,
            ExecutionStatus::Failed => Stage::Failed,
            ExecutionStatus::Cancelled => Stage::Aborted,
        };
        info!(outcome = %terminal, "execution finished");
        self.record_stage_transition(terminal);
        self.stage = terminal;
        Ok(terminal)
    }

    fn ensure_pre_execution(&self, operation: &'static str) -> Result<(), InvalidTransitionError> {
        if self.stage.is_terminal() {
            return Err(InvalidTransitionError::FromTerminalState { from: self.stage });
        }
        if self.stage == Stage::Executing {
            return Err(InvalidTransitionError::DuringExecution { operation });
        }
        Ok(())
    }

    fn record_stage_transition(&mut self, stage: Stage) {
        self.stage_history.push((stage, crate::hardware::unix_now()));
    }
}
