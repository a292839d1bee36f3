//! Execution engine
//!
//! Turns a [`FrozenPlan`](crate::plan::FrozenPlan) into an ordered list of
//! [`ExecutionStep`]s and runs them one at a time on a worker thread, with
//! best-effort rollback on failure or cancellation.
//!
//! - [`actions`]: step compilation and the do/undo capability pairs
//! - [`executor`]: the serialized step loop and rollback policy
//! - [`journal`]: the JSON Lines session artifact
//! - [`nixgen`]: `configuration.nix` rendering

pub mod actions;
pub mod executor;
pub mod journal;
pub mod nixgen;

pub use actions::{
    ExecutionStep, HookPhase, StepAction, StepLog, StepStatus, StepTransition, UndoAction,
    compile_actions,
};
pub use executor::{
    CancelToken, ExecutionEngine, ExecutionLog, ExecutionOutcome, ExecutionStatus,
    ManualInterventionRequired, RollbackReport, StepExecutionError, StepSummary,
};
pub use journal::{JournalEntry, JournalRecord, JournalSummary, SessionJournal, read_journal};

use std::path::{Component, Path, PathBuf};

/// Run-time parameters of an installation, derived from the installer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Where the target system is mounted on the live host
    pub target_root: PathBuf,
    /// `system.stateVersion` written into the generated configuration
    pub state_version: String,
    pub pre_install_hooks: Vec<PathBuf>,
    pub post_install_hooks: Vec<PathBuf>,
    /// Pass `--no-channel-copy` to nixos-install
    pub no_channel_copy: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/mnt"),
            state_version: "24.11".to_string(),
            pre_install_hooks: Vec::new(),
            post_install_hooks: Vec::new(),
            no_channel_copy: false,
        }
    }
}

impl EngineSettings {
    /// Directory receiving `configuration.nix` and `hardware-configuration.nix`.
    pub fn config_dir(&self) -> PathBuf {
        self.target_root.join("etc/nixos")
    }

    /// Host path of an absolute path inside the installed system.
    ///
    /// `/` maps to the target root itself, `/boot` to `<target_root>/boot`.
    pub fn host_path(&self, system_path: &Path) -> PathBuf {
        let relative: PathBuf = system_path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        if relative.as_os_str().is_empty() {
            self.target_root.clone()
        } else {
            self.target_root.join(relative)
        }
    }

    /// Artifact whose presence proves `nixos-install` built the system.
    pub fn system_profile(&self) -> PathBuf {
        self.target_root.join("nix/var/nix/profiles/system")
    }
}
