//! nixtui library
//!
//! Installation orchestration for NixOS: hardware inventory, a validated
//! installation plan, stage-gated session flow and a serialized execution
//! engine with best-effort rollback.

pub mod cli;
pub mod command_runner;
pub mod config;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod install_state;
pub mod installer;
pub mod plan;
pub mod process_guard;
pub mod sanity;
pub mod tool_args;
pub mod tools;
pub mod types;
pub mod validator;

// Re-export main types for convenience
pub use command_runner::{CommandRunner, CommandSpec, DryRunRunner, SystemRunner, ToolOutput};
pub use config::{ConfigError, InstallerSettings};
pub use config_file::PlanFile;
pub use engine::{
    CancelToken, EngineSettings, ExecutionEngine, ExecutionOutcome, ExecutionStatus,
    ManualInterventionRequired, StepExecutionError, StepStatus,
};
pub use error::NixTuiError;
pub use events::{EventReceiver, EventSender, ProgressEvent};
pub use hardware::{
    BlockDevice, FirmwareMode, HardwareProbe, HardwareSnapshot, PartialProbeError, ProbeError,
    ScanReport,
};
pub use install_state::{
    AdvanceOutcome, Decision, InvalidTransitionError, Orchestrator, Stage, UserRequest,
};
pub use plan::{
    FreezeError, FrozenPlan, IncompletePlanError, InstallationPlan, PartitionSize, PartitionSpec,
    PlanConstraintViolation,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use tool_args::ToolArgs;
pub use types::{BootloaderTarget, Filesystem, PartitionRole};
pub use validator::{BlockReason, ValidationPolicy, Verdict, can_advance};
