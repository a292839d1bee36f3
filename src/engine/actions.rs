//! Execution step compilation
//!
//! Translates a [`FrozenPlan`] into the ordered [`ExecutionStep`] list the
//! executor runs. Each step pairs a forward [`StepAction`] with an optional
//! [`UndoAction`]; `None` marks an action that cannot be reversed.
//!
//! # Fixed Order
//!
//! | Phase            | Steps |
//! |------------------|-------|
//! | partition        | one GPT write for the whole disk |
//! | format           | one per partition, layout order |
//! | mount            | root first, then by mount depth; swap activation last |
//! | generate-config  | hardware + system configuration |
//! | hooks            | pre-install hooks |
//! | build            | `nixos-install` |
//! | install-bootloader | `switch-to-configuration boot` |
//! | hooks            | post-install hooks |
//!
//! The order never depends on plan contents: later phases assume the filesystem
//! state produced by earlier ones.

use crate::engine::EngineSettings;
use crate::plan::{FrozenPlan, MountTarget, PartitionId, ResolvedPartition};
use crate::tools::disk::{GptPartition, PartitionTableArgs};
use crate::types::{BootloaderTarget, Filesystem, MIB, PartitionRole};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use strum::Display;

/// When a hook runs relative to the system build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HookPhase {
    PreInstall,
    PostInstall,
}

/// Forward action of one execution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Wipe signatures and write a fresh GPT with every planned partition
    PartitionDisk { disk: PathBuf },
    FormatPartition {
        partition: PartitionId,
        device: PathBuf,
        filesystem: Filesystem,
        label: String,
    },
    MountPartition {
        partition: PartitionId,
        device: PathBuf,
        /// Host path under the target root
        target: PathBuf,
    },
    ActivateSwap { partition: PartitionId, device: PathBuf },
    GenerateConfig { root: PathBuf, config_dir: PathBuf },
    RunHook { phase: HookPhase, script: PathBuf },
    BuildSystem { root: PathBuf },
    InstallBootloader { root: PathBuf, target: BootloaderTarget },
}

impl StepAction {
    /// Reverse action, or `None` when the action cannot be undone.
    pub fn undo(&self) -> Option<UndoAction> {
        match self {
            Self::PartitionDisk { disk } => Some(UndoAction::WipePartitionTable { disk: disk.clone() }),
            Self::FormatPartition { device, .. } => Some(UndoAction::WipeSignature {
                device: device.clone(),
            }),
            Self::MountPartition { target, .. } => Some(UndoAction::Unmount {
                target: target.clone(),
            }),
            Self::ActivateSwap { device, .. } => Some(UndoAction::DeactivateSwap {
                device: device.clone(),
            }),
            Self::GenerateConfig { config_dir, .. } => Some(UndoAction::RemoveGeneratedConfig {
                files: vec![
                    config_dir.join("configuration.nix"),
                    config_dir.join("hardware-configuration.nix"),
                ],
            }),
            Self::RunHook { .. } | Self::BuildSystem { .. } | Self::InstallBootloader { .. } => None,
        }
    }

    /// What an irreversible action leaves behind.
    pub fn lasting_effect(&self) -> String {
        match self {
            Self::RunHook { phase, script } => format!(
                "{} hook {} ran; its side effects are unknown to the installer",
                phase,
                script.display()
            ),
            Self::BuildSystem { root } => format!(
                "the system closure was copied into {}/nix/store",
                root.display()
            ),
            Self::InstallBootloader { target, .. } => format!(
                "a {} bootloader may have been partially written",
                target
            ),
            Self::PartitionDisk { disk } => format!("the partition table of {} was rewritten", disk.display()),
            Self::FormatPartition { device, filesystem, .. } => {
                format!("{} was formatted as {}", device.display(), filesystem)
            }
            Self::MountPartition { device, target, .. } => {
                format!("{} may be mounted at {}", device.display(), target.display())
            }
            Self::ActivateSwap { device, .. } => format!("swap on {} may be active", device.display()),
            Self::GenerateConfig { config_dir, .. } => {
                format!("configuration files may exist in {}", config_dir.display())
            }
        }
    }

    /// What a failed attempt may have left on disk once its first command ran.
    ///
    /// `None` for actions whose failure leaves the disk contents untouched.
    pub fn partial_effect(&self) -> Option<String> {
        match self {
            Self::PartitionDisk { disk } => Some(format!(
                "{} may already be wiped and hold a partially written partition table",
                disk.display()
            )),
            Self::FormatPartition { device, filesystem, .. } => Some(format!(
                "{} may hold a partially written {} filesystem",
                device.display(),
                filesystem
            )),
            _ => None,
        }
    }

    /// Position of the action's phase in the fixed order.
    pub fn phase_rank(&self) -> u8 {
        match self {
            Self::PartitionDisk { .. } => 0,
            Self::FormatPartition { .. } => 1,
            Self::MountPartition { .. } | Self::ActivateSwap { .. } => 2,
            Self::GenerateConfig { .. } => 3,
            Self::RunHook {
                phase: HookPhase::PreInstall,
                ..
            } => 4,
            Self::BuildSystem { .. } => 5,
            Self::InstallBootloader { .. } => 6,
            Self::RunHook {
                phase: HookPhase::PostInstall,
                ..
            } => 7,
        }
    }
}

/// Reverse action used during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "undo", rename_all = "snake_case")]
pub enum UndoAction {
    WipePartitionTable { disk: PathBuf },
    WipeSignature { device: PathBuf },
    Unmount { target: PathBuf },
    DeactivateSwap { device: PathBuf },
    RemoveGeneratedConfig { files: Vec<PathBuf> },
}

impl UndoAction {
    /// Destroys data on disk; never run once an irreversible step depends on it.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::WipePartitionTable { .. } | Self::WipeSignature { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::WipePartitionTable { disk } => format!("wipe the partition table of {}", disk.display()),
            Self::WipeSignature { device } => format!("wipe the filesystem signature on {}", device.display()),
            Self::Unmount { target } => format!("unmount {}", target.display()),
            Self::DeactivateSwap { device } => format!("deactivate swap on {}", device.display()),
            Self::RemoveGeneratedConfig { files } => format!(
                "remove {}",
                files
                    .iter()
                    .map(|f| f.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

/// One status change of one step, as delivered on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransition {
    pub index: usize,
    pub label: String,
    pub from: StepStatus,
    pub to: StepStatus,
    /// Unix timestamp (seconds)
    pub at: u64,
}

impl fmt::Display for StepTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {} -> {}", self.index + 1, self.label, self.from, self.to)
    }
}

/// Output lines of one step.
///
/// Finite: once closed, further lines are rejected and the log cannot be reopened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepLog {
    lines: Vec<String>,
    closed: bool,
}

impl StepLog {
    /// Append a line; returns false if the log is already closed.
    pub fn push(&mut self, line: impl Into<String>) -> bool {
        if self.closed {
            return false;
        }
        self.lines.push(line.into());
        true
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One atomic, loggable, possibly reversible installation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStep {
    pub index: usize,
    pub label: String,
    pub action: StepAction,
    pub undo: Option<UndoAction>,
    pub status: StepStatus,
    pub log: StepLog,
}

impl ExecutionStep {
    pub fn new(index: usize, label: impl Into<String>, action: StepAction) -> Self {
        let undo = action.undo();
        Self {
            index,
            label: label.into(),
            action,
            undo,
            status: StepStatus::Pending,
            log: StepLog::default(),
        }
    }

    pub fn is_reversible(&self) -> bool {
        self.undo.is_some()
    }

    /// Move to `to` and describe the change.
    pub fn transition(&mut self, to: StepStatus) -> StepTransition {
        let from = self.status;
        self.status = to;
        StepTransition {
            index: self.index,
            label: self.label.clone(),
            from,
            to,
            at: crate::hardware::unix_now(),
        }
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Compile a frozen plan into the fixed-order step list.
pub fn compile_actions(plan: &FrozenPlan, settings: &EngineSettings) -> Vec<ExecutionStep> {
    let root = settings.target_root.clone();
    let mut actions: Vec<(String, StepAction)> = Vec::new();

    actions.push((
        "partition".to_string(),
        StepAction::PartitionDisk {
            disk: PathBuf::from(&plan.device_id),
        },
    ));

    for part in &plan.partitions {
        actions.push((
            format!("format({})", part.label()),
            StepAction::FormatPartition {
                partition: part.id,
                device: part.device_path.clone(),
                filesystem: part.filesystem,
                label: filesystem_label(part),
            },
        ));
    }

    let mut mounts: Vec<(&ResolvedPartition, &Path)> = plan
        .partitions
        .iter()
        .filter_map(|p| match &p.mount {
            MountTarget::Path(path) => Some((p, path.as_path())),
            MountTarget::Swap => None,
        })
        .collect();
    // Stable sort keeps layout order among equal depths
    mounts.sort_by_key(|(_, path)| mount_depth(path));
    for (part, path) in mounts {
        actions.push((
            format!("mount({})", part.label()),
            StepAction::MountPartition {
                partition: part.id,
                device: part.device_path.clone(),
                target: settings.host_path(path),
            },
        ));
    }
    for part in plan.partitions.iter().filter(|p| p.mount == MountTarget::Swap) {
        actions.push((
            format!("swapon({})", part.label()),
            StepAction::ActivateSwap {
                partition: part.id,
                device: part.device_path.clone(),
            },
        ));
    }

    actions.push((
        "generate-config".to_string(),
        StepAction::GenerateConfig {
            root: root.clone(),
            config_dir: settings.config_dir(),
        },
    ));

    for script in &settings.pre_install_hooks {
        actions.push(hook_action(HookPhase::PreInstall, script));
    }

    actions.push(("build".to_string(), StepAction::BuildSystem { root: root.clone() }));
    actions.push((
        "install-bootloader".to_string(),
        StepAction::InstallBootloader {
            root,
            target: plan.bootloader_target,
        },
    ));

    for script in &settings.post_install_hooks {
        actions.push(hook_action(HookPhase::PostInstall, script));
    }

    actions
        .into_iter()
        .enumerate()
        .map(|(index, (label, action))| ExecutionStep::new(index, label, action))
        .collect()
}

/// GPT layout for the partition step, including the BIOS boot partition when needed.
pub fn partition_table_args(plan: &FrozenPlan) -> PartitionTableArgs {
    let mut partitions = Vec::with_capacity(plan.partitions.len() + 1);
    if plan.bios_boot_partition.is_some() {
        partitions.push(GptPartition {
            number: 1,
            start_mib: 1,
            size_mib: crate::plan::BIOS_BOOT_PARTITION_SIZE / MIB,
            type_code: "EF02",
            name: "bios_grub".to_string(),
        });
    }
    for part in &plan.partitions {
        partitions.push(GptPartition {
            number: part.number,
            start_mib: part.start_mib,
            size_mib: part.size_bytes / MIB,
            type_code: part.role.gpt_type_code(plan.bootloader_target),
            name: partition_name(part),
        });
    }
    PartitionTableArgs {
        disk: PathBuf::from(&plan.device_id),
        partitions,
    }
}

fn hook_action(phase: HookPhase, script: &Path) -> (String, StepAction) {
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string());
    (
        format!("hook({}:{})", phase, name),
        StepAction::RunHook {
            phase,
            script: script.to_path_buf(),
        },
    )
}

fn mount_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// GPT partition name: the role, or the last mount path component for custom partitions.
fn partition_name(part: &ResolvedPartition) -> String {
    match (&part.role, &part.mount) {
        (PartitionRole::Custom, MountTarget::Path(path)) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string()),
        (role, _) => role.to_string(),
    }
}

/// Filesystem label, at most 16 characters (the ext4 limit).
fn filesystem_label(part: &ResolvedPartition) -> String {
    let label = match part.role {
        PartitionRole::Root => "nixos".to_string(),
        _ => partition_name(part),
    };
    label.chars().take(16).collect()
}
