//! Stage validators
//!
//! [`can_advance`] decides whether the session may leave a stage. It is pure:
//! the same stage, plan, snapshot and policy always produce the same
//! [`Verdict`], so the presentation layer can call it on every keystroke.
//!
//! Checks are cumulative. Leaving a stage re-checks everything decided in the
//! stages before it, which is how a hardware re-scan that removed or resized the
//! target disk surfaces on the next `advance()`.

use crate::hardware::HardwareSnapshot;
use crate::install_state::Stage;
use crate::plan::{
    FreezeError, InstallationPlan, MissingField, PARTITION_TABLE_OVERHEAD, PlanConstraintViolation,
};
use crate::types::{MIB, PartitionRole, format_bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Limits the validators enforce. Built from the `[limits]` settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Minimum EFI System Partition size (UEFI targets only)
    pub min_boot_bytes: u64,
    pub min_root_bytes: u64,
    /// Whether a plan may lift the exactly-one-administrator rule
    pub allow_admin_waiver: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_boot_bytes: 256 * MIB,
            min_root_bytes: 4096 * MIB,
            allow_admin_waiver: false,
        }
    }
}

/// The part of the session a blocking reason refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanField {
    Hardware,
    TargetDevice,
    PartitionLayout,
    Bootloader,
    Identity,
    Users,
    Confirmation,
    Stage,
}

/// One human-readable reason a transition is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReason {
    pub field: PlanField,
    pub message: String,
}

impl BlockReason {
    pub fn new(field: PlanField, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<&PlanConstraintViolation> for BlockReason {
    fn from(v: &PlanConstraintViolation) -> Self {
        Self::new(field_for(v), v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reasons", rename_all = "snake_case")]
pub enum Verdict {
    Allowed,
    /// Ordered reasons, most fundamental first
    Blocked(Vec<BlockReason>),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reasons(&self) -> &[BlockReason] {
        match self {
            Self::Allowed => &[],
            Self::Blocked(reasons) => reasons,
        }
    }

    fn from_reasons(reasons: Vec<BlockReason>) -> Self {
        if reasons.is_empty() {
            Self::Allowed
        } else {
            Self::Blocked(reasons)
        }
    }
}

/// Decide whether the session may leave `stage` with the given plan.
pub fn can_advance(
    stage: Stage,
    plan: &InstallationPlan,
    snapshot: &HardwareSnapshot,
    policy: &ValidationPolicy,
) -> Verdict {
    let mut reasons = Vec::new();

    match stage {
        Stage::Welcome => check_hardware(snapshot, &mut reasons),
        Stage::DiskSelection => {
            check_disk(plan, snapshot, policy, &mut reasons);
        }
        Stage::PartitionPlanning => {
            check_disk(plan, snapshot, policy, &mut reasons);
            check_layout(plan, policy, &mut reasons);
        }
        Stage::Identity => {
            check_disk(plan, snapshot, policy, &mut reasons);
            check_layout(plan, policy, &mut reasons);
            check_identity(plan, &mut reasons);
        }
        Stage::UserSetup => {
            check_disk(plan, snapshot, policy, &mut reasons);
            check_layout(plan, policy, &mut reasons);
            check_identity(plan, &mut reasons);
            check_users(plan, policy, &mut reasons);
        }
        Stage::Review => {
            check_disk(plan, snapshot, policy, &mut reasons);
            check_layout(plan, policy, &mut reasons);
            check_identity(plan, &mut reasons);
            check_users(plan, policy, &mut reasons);
            if reasons.is_empty() {
                if let Err(e) = plan.freeze() {
                    reasons.push(freeze_reason(&e));
                }
            }
        }
        Stage::Executing | Stage::Completed | Stage::Failed | Stage::Aborted => {
            reasons.push(BlockReason::new(
                PlanField::Stage,
                format!("{} has no user-driven forward transition", stage),
            ));
        }
    }

    Verdict::from_reasons(reasons)
}

// ============================================================================
// Per-area checks
// ============================================================================

fn check_hardware(snapshot: &HardwareSnapshot, reasons: &mut Vec<BlockReason>) {
    if snapshot.installable_devices().next().is_none() {
        let message = if snapshot.block_devices.is_empty() {
            "no disks were found; attach a disk and re-scan".to_string()
        } else {
            format!(
                "none of the {} detected disks reports a usable size; re-scan or check the hardware",
                snapshot.block_devices.len()
            )
        };
        reasons.push(BlockReason::new(PlanField::Hardware, message));
    }
}

fn check_disk(
    plan: &InstallationPlan,
    snapshot: &HardwareSnapshot,
    policy: &ValidationPolicy,
    reasons: &mut Vec<BlockReason>,
) {
    let Some(target) = plan.target_device() else {
        reasons.push(BlockReason::new(
            PlanField::TargetDevice,
            "select a target disk",
        ));
        return;
    };

    if let Err(v) = plan.resolve_against(snapshot) {
        reasons.push(BlockReason::from(&v));
        return;
    }

    let usable = plan.usable_bytes(target.capacity_bytes);
    let min_boot = if plan.bootloader_target().is_uefi() {
        policy.min_boot_bytes
    } else {
        0
    };
    if usable < min_boot + policy.min_root_bytes {
        let boot_note = if min_boot > 0 {
            format!(" plus {} for the EFI boot partition", format_bytes(min_boot))
        } else {
            String::new()
        };
        reasons.push(BlockReason::new(
            PlanField::TargetDevice,
            format!(
                "{} ({}) is too small: the minimum root size is {}{} and {} is needed for the partition table",
                target.id,
                format_bytes(target.capacity_bytes),
                format_bytes(policy.min_root_bytes),
                boot_note,
                format_bytes(PARTITION_TABLE_OVERHEAD),
            ),
        ));
    }

    if let Some(device) = snapshot.device(&target.id) {
        let mounted: Vec<String> = device
            .active_mounts()
            .iter()
            .map(ToString::to_string)
            .collect();
        if !mounted.is_empty() {
            reasons.push(BlockReason::new(
                PlanField::TargetDevice,
                format!(
                    "{} is in use by mounted filesystems ({}); unmount them first",
                    target.id,
                    mounted.join(", ")
                ),
            ));
        }
    }

    push_violations(plan, &[PlanField::TargetDevice], reasons);
}

fn check_layout(plan: &InstallationPlan, policy: &ValidationPolicy, reasons: &mut Vec<BlockReason>) {
    let uefi = plan.bootloader_target().is_uefi();

    match plan.partition_by_role(PartitionRole::Root) {
        None => reasons.push(BlockReason::new(
            PlanField::PartitionLayout,
            "a root partition is required",
        )),
        Some(entry) => {
            if let Some(size) = plan.resolved_size(entry.id) {
                if size < policy.min_root_bytes {
                    reasons.push(BlockReason::new(
                        PlanField::PartitionLayout,
                        format!(
                            "root partition is {}; the minimum root size is {}",
                            format_bytes(size),
                            format_bytes(policy.min_root_bytes)
                        ),
                    ));
                }
            }
        }
    }

    match plan.partition_by_role(PartitionRole::Boot) {
        None if uefi => reasons.push(BlockReason::new(
            PlanField::PartitionLayout,
            "UEFI installs need an EFI boot partition",
        )),
        Some(entry) if uefi => {
            let size = plan.resolved_size(entry.id);
            if let Some(size) = size.filter(|s| *s < policy.min_boot_bytes) {
                reasons.push(BlockReason::new(
                    PlanField::PartitionLayout,
                    format!(
                        "boot partition is {}; the minimum boot size is {}",
                        format_bytes(size),
                        format_bytes(policy.min_boot_bytes)
                    ),
                ));
            }
        }
        _ => {}
    }

    push_violations(plan, &[PlanField::PartitionLayout, PlanField::Bootloader], reasons);
}

fn check_identity(plan: &InstallationPlan, reasons: &mut Vec<BlockReason>) {
    if plan.identity().is_none() {
        reasons.push(BlockReason::new(
            PlanField::Identity,
            "set a hostname, locale and timezone",
        ));
    }
    push_violations(plan, &[PlanField::Identity], reasons);
}

fn check_users(plan: &InstallationPlan, policy: &ValidationPolicy, reasons: &mut Vec<BlockReason>) {
    if plan.users().is_empty() {
        reasons.push(BlockReason::new(PlanField::Users, "add at least one user"));
    } else if !plan.has_login_credential() {
        reasons.push(BlockReason::new(
            PlanField::Users,
            "no account could log in to the installed system: give a user a password hash or \
             SSH key, or set a root password hash",
        ));
    }

    if plan.is_admin_waived() {
        if !policy.allow_admin_waiver {
            reasons.push(BlockReason::new(
                PlanField::Users,
                "the administrator requirement cannot be waived on this installer",
            ));
        }
    } else if !plan.users().is_empty() && plan.admin_count() != 1 {
        reasons.push(BlockReason::from(&PlanConstraintViolation::AdminCount {
            found: plan.admin_count(),
        }));
    }

    push_violations(plan, &[PlanField::Users], reasons);
}

/// Append plan invariant violations belonging to `fields`.
///
/// `AdminCount` is reported by `check_users` directly.
fn push_violations(plan: &InstallationPlan, fields: &[PlanField], reasons: &mut Vec<BlockReason>) {
    for v in plan.violations() {
        if matches!(v, PlanConstraintViolation::AdminCount { .. }) {
            continue;
        }
        if fields.contains(&field_for(&v)) {
            reasons.push(BlockReason::from(&v));
        }
    }
}

fn field_for(v: &PlanConstraintViolation) -> PlanField {
    use PlanConstraintViolation as V;
    match v {
        V::NoTargetDevice
        | V::UnknownDevice { .. }
        | V::DeviceSizeUnknown { .. }
        | V::TargetDeviceMissing { .. }
        | V::TargetDeviceChanged { .. } => PlanField::TargetDevice,
        V::MultipleBootPartitions
        | V::MultipleRootPartitions
        | V::MultipleRemainderPartitions
        | V::ZeroSizedPartition { .. }
        | V::CapacityExceeded { .. }
        | V::IncompatibleFilesystem { .. }
        | V::MissingMountPoint { .. }
        | V::UnexpectedMountPoint { .. }
        | V::InvalidMountPoint { .. }
        | V::DuplicateMountPoint { .. }
        | V::UnknownPartition { .. } => PlanField::PartitionLayout,
        V::BootloaderOverrideUnconfirmed { .. } => PlanField::Bootloader,
        V::InvalidHostname { .. } | V::InvalidLocale { .. } | V::InvalidTimezone { .. } => {
            PlanField::Identity
        }
        V::InvalidUsername { .. }
        | V::DuplicateUser { .. }
        | V::UnknownUser { .. }
        | V::InvalidPasswordHash { .. }
        | V::AdminCount { .. } => PlanField::Users,
    }
}

fn freeze_reason(err: &FreezeError) -> BlockReason {
    match err {
        FreezeError::Constraint(v) => BlockReason::from(v),
        FreezeError::Incomplete(inc) => {
            let field = match inc.missing.first() {
                Some(MissingField::TargetDevice) => PlanField::TargetDevice,
                Some(MissingField::RootPartition | MissingField::BootPartition) => {
                    PlanField::PartitionLayout
                }
                Some(MissingField::Identity) => PlanField::Identity,
                Some(MissingField::Users) | None => PlanField::Users,
            };
            BlockReason::new(field, inc.to_string())
        }
    }
}
