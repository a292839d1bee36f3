//! Installation plan model
//!
//! [`InstallationPlan`] holds every user decision made during the guided stages.
//! It is plain data with validated mutators only: each mutator runs against a
//! candidate copy, checks every plan invariant, and commits only if all hold. A
//! failed mutation returns a [`PlanConstraintViolation`] and leaves the plan
//! untouched.
//!
//! [`InstallationPlan::freeze`] resolves the plan into a [`FrozenPlan`]: an
//! immutable, cheaply clonable value with concrete partition geometry, device
//! paths and the derived mount plan. Only the execution engine consumes it.
//!
//! The target device is held by id (a weak reference into the hardware
//! snapshot) and re-resolved by [`InstallationPlan::resolve_against`].

use crate::hardware::{FirmwareMode, HardwareSnapshot};
use crate::types::{BootloaderTarget, Filesystem, MIB, PartitionRole, align_up_mib, format_bytes};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Space reserved for GPT headers and alignment (1 MiB lead-in, 1 MiB backup table).
pub const PARTITION_TABLE_OVERHEAD: u64 = 2 * MIB;

/// Size of the GRUB BIOS boot partition created for BIOS targets.
pub const BIOS_BOOT_PARTITION_SIZE: u64 = MIB;

/// Usernames NixOS reserves for system accounts.
const RESERVED_USERNAMES: &[&str] = &["root", "nixbld", "nobody", "messagebus", "systemd-network"];

/// Plan-assigned partition identifier, stable for the plan's lifetime.
pub type PartitionId = u32;

// ============================================================================
// Plan vocabulary
// ============================================================================

/// Requested partition size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSize {
    /// Exact size in bytes (rounded up to whole MiB on disk)
    Exact(u64),
    /// Whatever space is left once exact partitions are placed
    Remaining,
}

impl PartitionSize {
    pub const fn mib(n: u64) -> Self {
        Self::Exact(n.saturating_mul(MIB))
    }

    pub const fn gib(n: u64) -> Self {
        Self::Exact(n.saturating_mul(crate::types::GIB))
    }
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(bytes) => write!(f, "{}", format_bytes(*bytes)),
            Self::Remaining => write!(f, "remaining space"),
        }
    }
}

/// One requested partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub role: PartitionRole,
    pub size: PartitionSize,
    pub filesystem: Filesystem,
    /// Only custom partitions carry an explicit mount point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
}

impl PartitionSpec {
    pub fn new(role: PartitionRole, size: PartitionSize, filesystem: Filesystem) -> Self {
        Self {
            role,
            size,
            filesystem,
            mount_point: None,
        }
    }

    pub fn custom(mount_point: impl Into<PathBuf>, size: PartitionSize, filesystem: Filesystem) -> Self {
        Self {
            role: PartitionRole::Custom,
            size,
            filesystem,
            mount_point: Some(mount_point.into()),
        }
    }

    /// Where this partition lands in the installed system.
    ///
    /// `None` only for a custom partition without a mount point, which the plan
    /// invariants reject.
    pub fn mount_target(&self) -> Option<MountTarget> {
        match self.role {
            PartitionRole::Boot => Some(MountTarget::Path(PathBuf::from("/boot"))),
            PartitionRole::Root => Some(MountTarget::Path(PathBuf::from("/"))),
            PartitionRole::Swap => Some(MountTarget::Swap),
            PartitionRole::Custom => self.mount_point.clone().map(MountTarget::Path),
        }
    }
}

/// Mount destination derived from a partition's role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountTarget {
    /// Absolute path inside the installed system
    Path(PathBuf),
    /// Activated as swap rather than mounted
    Swap,
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Swap => write!(f, "[swap]"),
        }
    }
}

/// A partition as stored in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub id: PartitionId,
    pub spec: PartitionSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemIdentity {
    pub hostname: String,
    pub locale: String,
    pub timezone: String,
}

/// How a user authenticates on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    /// crypt(3) hash, e.g. from `mkpasswd -m sha-512`
    HashedPassword { hash: String },
    AuthorizedKeys { keys: Vec<String> },
    /// Account stays locked until a password is set from the installed system
    SetAfterInstall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    pub is_admin: bool,
    pub auth_method: AuthMethod,
}

/// Weak reference to the selected disk, captured at selection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    pub id: String,
    pub capacity_bytes: u64,
    /// Generation of the snapshot the device was selected from
    pub snapshot_generation: u64,
}

// ============================================================================
// Errors
// ============================================================================

/// A plan invariant that a mutation (or re-validation) would violate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanConstraintViolation {
    #[error("a target device must be selected before partitions are planned")]
    NoTargetDevice,

    #[error("device {id} is not present in the current hardware snapshot")]
    UnknownDevice { id: String },

    #[error("device {id} has an unknown capacity and cannot be an installation target")]
    DeviceSizeUnknown { id: String },

    #[error("target device {id} vanished after a hardware re-scan")]
    TargetDeviceMissing { id: String },

    #[error(
        "target device {id} changed capacity after a hardware re-scan ({} -> {})",
        format_bytes(*.was), format_bytes(*.now)
    )]
    TargetDeviceChanged { id: String, was: u64, now: u64 },

    #[error("at most one boot partition is allowed")]
    MultipleBootPartitions,

    #[error("at most one root partition is allowed")]
    MultipleRootPartitions,

    #[error("at most one partition may take the remaining space")]
    MultipleRemainderPartitions,

    #[error("partition #{id} must have a non-zero size")]
    ZeroSizedPartition { id: PartitionId },

    #[error(
        "total partition sizes exceed device capacity: {} requested, {} usable",
        format_bytes(*.requested), format_bytes(*.usable)
    )]
    CapacityExceeded { requested: u64, usable: u64 },

    #[error("{role} partition cannot use {filesystem}: {reason}")]
    IncompatibleFilesystem {
        role: PartitionRole,
        filesystem: Filesystem,
        reason: &'static str,
    },

    #[error("custom partition #{id} needs a mount point")]
    MissingMountPoint { id: PartitionId },

    #[error("{role} partition #{id} has a fixed mount point and cannot set one")]
    UnexpectedMountPoint { id: PartitionId, role: PartitionRole },

    #[error("mount point {path} must be an absolute path other than /")]
    InvalidMountPoint { path: String },

    #[error("mount point {path} is used by more than one partition")]
    DuplicateMountPoint { path: String },

    #[error("no partition #{id} in the plan")]
    UnknownPartition { id: PartitionId },

    #[error("invalid hostname '{hostname}': {reason}")]
    InvalidHostname { hostname: String, reason: &'static str },

    #[error("invalid locale '{locale}'")]
    InvalidLocale { locale: String },

    #[error("invalid timezone '{timezone}'")]
    InvalidTimezone { timezone: String },

    #[error("invalid username '{name}': {reason}")]
    InvalidUsername { name: String, reason: &'static str },

    #[error("user {name} already exists")]
    DuplicateUser { name: String },

    #[error("no user named {name} in the plan")]
    UnknownUser { name: String },

    #[error("password hash for {name} is not usable: {reason}")]
    InvalidPasswordHash { name: String, reason: &'static str },

    #[error("exactly one user must be an administrator (found {found})")]
    AdminCount { found: usize },

    #[error("installing a {requested} bootloader on {firmware} firmware requires explicit confirmation")]
    BootloaderOverrideUnconfirmed {
        firmware: FirmwareMode,
        requested: BootloaderTarget,
    },
}

/// A field `freeze()` needs that has not been decided yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    TargetDevice,
    RootPartition,
    /// UEFI targets need an EFI System Partition
    BootPartition,
    Identity,
    Users,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TargetDevice => "target device",
            Self::RootPartition => "root partition",
            Self::BootPartition => "EFI boot partition",
            Self::Identity => "system identity",
            Self::Users => "at least one user",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("installation plan is incomplete: missing {}", join_fields(.missing))]
pub struct IncompletePlanError {
    pub missing: Vec<MissingField>,
}

fn join_fields(fields: &[MissingField]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why `freeze()` refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FreezeError {
    #[error(transparent)]
    Incomplete(#[from] IncompletePlanError),

    #[error(transparent)]
    Constraint(#[from] PlanConstraintViolation),
}

// ============================================================================
// InstallationPlan
// ============================================================================

/// The mutable plan owned by the orchestration state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationPlan {
    firmware: FirmwareMode,
    target_device: Option<TargetDevice>,
    layout: Vec<LayoutEntry>,
    next_partition_id: PartitionId,
    identity: Option<SystemIdentity>,
    users: Vec<UserSpec>,
    bootloader_target: BootloaderTarget,
    bootloader_override_confirmed: bool,
    admin_waived: bool,
    /// crypt(3) hash for root; `None` leaves the root account locked
    #[serde(default)]
    root_password_hash: Option<String>,
}

impl InstallationPlan {
    /// Empty plan whose bootloader target follows the detected firmware.
    pub fn new(firmware: FirmwareMode) -> Self {
        Self {
            firmware,
            target_device: None,
            layout: Vec::new(),
            next_partition_id: 1,
            identity: None,
            users: Vec::new(),
            bootloader_target: firmware.into(),
            bootloader_override_confirmed: false,
            admin_waived: false,
            root_password_hash: None,
        }
    }

    pub fn for_snapshot(snapshot: &HardwareSnapshot) -> Self {
        Self::new(snapshot.firmware)
    }

    /// Full-disk layout: EFI 512 MiB (UEFI only), optional swap, root on the rest.
    pub fn default_layout(target: BootloaderTarget, swap_gib: Option<u64>) -> Vec<PartitionSpec> {
        let mut layout = Vec::new();
        if target.is_uefi() {
            layout.push(PartitionSpec::new(
                PartitionRole::Boot,
                PartitionSize::mib(512),
                Filesystem::Fat32,
            ));
        }
        if let Some(gib) = swap_gib.filter(|g| *g > 0) {
            layout.push(PartitionSpec::new(
                PartitionRole::Swap,
                PartitionSize::gib(gib),
                Filesystem::Swap,
            ));
        }
        layout.push(PartitionSpec::new(
            PartitionRole::Root,
            PartitionSize::Remaining,
            Filesystem::Ext4,
        ));
        layout
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn firmware(&self) -> FirmwareMode {
        self.firmware
    }

    pub fn target_device(&self) -> Option<&TargetDevice> {
        self.target_device.as_ref()
    }

    pub fn layout(&self) -> &[LayoutEntry] {
        &self.layout
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionSpec> {
        self.layout.iter().find(|e| e.id == id).map(|e| &e.spec)
    }

    /// First partition with the given role.
    pub fn partition_by_role(&self, role: PartitionRole) -> Option<&LayoutEntry> {
        self.layout.iter().find(|e| e.spec.role == role)
    }

    pub fn identity(&self) -> Option<&SystemIdentity> {
        self.identity.as_ref()
    }

    pub fn users(&self) -> &[UserSpec] {
        &self.users
    }

    pub fn admin_count(&self) -> usize {
        self.users.iter().filter(|u| u.is_admin).count()
    }

    pub fn root_password_hash(&self) -> Option<&str> {
        self.root_password_hash.as_deref()
    }

    /// Whether the installed system will have an account that can log in.
    ///
    /// Users set to `SetAfterInstall` stay locked, so they only count once
    /// root or another user has a credential.
    pub fn has_login_credential(&self) -> bool {
        self.root_password_hash.is_some()
            || self.users.iter().any(|u| {
                matches!(
                    u.auth_method,
                    AuthMethod::HashedPassword { .. } | AuthMethod::AuthorizedKeys { .. }
                )
            })
    }

    pub fn bootloader_target(&self) -> BootloaderTarget {
        self.bootloader_target
    }

    pub fn is_admin_waived(&self) -> bool {
        self.admin_waived
    }

    /// Derived mount plan: exactly one entry per layout entry, in layout order.
    pub fn mount_plan(&self) -> Vec<(PartitionId, MountTarget)> {
        self.layout
            .iter()
            .filter_map(|e| e.spec.mount_target().map(|t| (e.id, t)))
            .collect()
    }

    /// Bytes the layout needs, with exact sizes MiB-aligned and 1 MiB minimum for a remainder.
    pub fn requested_bytes(&self) -> u64 {
        self.layout
            .iter()
            .map(|e| match e.spec.size {
                PartitionSize::Exact(bytes) => align_up_mib(bytes),
                PartitionSize::Remaining => MIB,
            })
            .fold(0, u64::saturating_add)
    }

    /// Bytes available for user partitions on a device of `capacity` bytes.
    pub fn usable_bytes(&self, capacity: u64) -> u64 {
        let bios = if self.bootloader_target.is_uefi() {
            0
        } else {
            BIOS_BOOT_PARTITION_SIZE
        };
        (capacity / MIB * MIB).saturating_sub(PARTITION_TABLE_OVERHEAD + bios)
    }

    /// Resolved size of the remainder partition, if the layout has one.
    pub fn remainder_bytes(&self) -> Option<u64> {
        let device = self.target_device.as_ref()?;
        self.layout
            .iter()
            .any(|e| e.spec.size == PartitionSize::Remaining)
            .then(|| {
                let exact: u64 = self
                    .layout
                    .iter()
                    .filter_map(|e| match e.spec.size {
                        PartitionSize::Exact(b) => Some(align_up_mib(b)),
                        PartitionSize::Remaining => None,
                    })
                    .fold(0, u64::saturating_add);
                self.usable_bytes(device.capacity_bytes).saturating_sub(exact)
            })
    }

    /// Resolved byte size of one partition.
    pub fn resolved_size(&self, id: PartitionId) -> Option<u64> {
        match self.partition(id)?.size {
            PartitionSize::Exact(bytes) => Some(align_up_mib(bytes)),
            PartitionSize::Remaining => self.remainder_bytes(),
        }
    }

    // ------------------------------------------------------------------
    // Validated mutators
    // ------------------------------------------------------------------

    /// Apply `change` to a candidate copy; commit only if every invariant holds.
    fn try_mutate<T>(
        &mut self,
        change: impl FnOnce(&mut Self) -> Result<T, PlanConstraintViolation>,
    ) -> Result<T, PlanConstraintViolation> {
        let mut candidate = self.clone();
        let out = change(&mut candidate)?;
        candidate.check_invariants()?;
        *self = candidate;
        Ok(out)
    }

    /// Select the installation disk from the given snapshot.
    pub fn set_target_device(
        &mut self,
        snapshot: &HardwareSnapshot,
        device_id: &str,
    ) -> Result<(), PlanConstraintViolation> {
        let device = snapshot
            .device(device_id)
            .ok_or_else(|| PlanConstraintViolation::UnknownDevice {
                id: device_id.to_string(),
            })?;
        let capacity_bytes = device
            .size_bytes
            .ok_or_else(|| PlanConstraintViolation::DeviceSizeUnknown {
                id: device_id.to_string(),
            })?;
        let target = TargetDevice {
            id: device.id.clone(),
            capacity_bytes,
            snapshot_generation: snapshot.generation,
        };
        self.try_mutate(|plan| {
            plan.target_device = Some(target);
            Ok(())
        })
    }

    /// Append a partition; returns its plan-assigned id.
    pub fn add_partition(&mut self, spec: PartitionSpec) -> Result<PartitionId, PlanConstraintViolation> {
        self.try_mutate(|plan| {
            let id = plan.next_partition_id;
            plan.next_partition_id += 1;
            plan.layout.push(LayoutEntry { id, spec });
            Ok(id)
        })
    }

    pub fn remove_partition(&mut self, id: PartitionId) -> Result<PartitionSpec, PlanConstraintViolation> {
        self.try_mutate(|plan| {
            let pos = plan
                .layout
                .iter()
                .position(|e| e.id == id)
                .ok_or(PlanConstraintViolation::UnknownPartition { id })?;
            Ok(plan.layout.remove(pos).spec)
        })
    }

    pub fn resize_partition(
        &mut self,
        id: PartitionId,
        size: PartitionSize,
    ) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            let entry = plan
                .layout
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(PlanConstraintViolation::UnknownPartition { id })?;
            entry.spec.size = size;
            Ok(())
        })
    }

    /// Replace the whole layout in one validated step; returns the new ids.
    pub fn replace_layout(
        &mut self,
        specs: Vec<PartitionSpec>,
    ) -> Result<Vec<PartitionId>, PlanConstraintViolation> {
        self.try_mutate(|plan| {
            plan.layout.clear();
            let mut ids = Vec::with_capacity(specs.len());
            for spec in specs {
                let id = plan.next_partition_id;
                plan.next_partition_id += 1;
                plan.layout.push(LayoutEntry { id, spec });
                ids.push(id);
            }
            Ok(ids)
        })
    }

    pub fn set_identity(&mut self, identity: SystemIdentity) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            plan.identity = Some(identity);
            Ok(())
        })
    }

    pub fn add_user(&mut self, user: UserSpec) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            if plan.users.iter().any(|u| u.name == user.name) {
                return Err(PlanConstraintViolation::DuplicateUser { name: user.name });
            }
            plan.users.push(user);
            Ok(())
        })
    }

    pub fn remove_user(&mut self, name: &str) -> Result<UserSpec, PlanConstraintViolation> {
        self.try_mutate(|plan| {
            let pos = plan
                .users
                .iter()
                .position(|u| u.name == name)
                .ok_or_else(|| PlanConstraintViolation::UnknownUser {
                    name: name.to_string(),
                })?;
            Ok(plan.users.remove(pos))
        })
    }

    /// Choose the bootloader target.
    ///
    /// Targets that differ from the detected firmware need `confirmed = true`.
    pub fn set_bootloader_target(
        &mut self,
        target: BootloaderTarget,
        confirmed: bool,
    ) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            plan.bootloader_target = target;
            plan.bootloader_override_confirmed = confirmed;
            Ok(())
        })
    }

    /// Set (or clear) the root password as a crypt(3) hash.
    pub fn set_root_password_hash(&mut self, hash: Option<String>) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            plan.root_password_hash = hash;
            Ok(())
        })
    }

    /// Lift (or restore) the exactly-one-administrator requirement.
    pub fn set_admin_waiver(&mut self, waived: bool) -> Result<(), PlanConstraintViolation> {
        self.try_mutate(|plan| {
            plan.admin_waived = waived;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// First violated invariant, if any.
    pub fn check_invariants(&self) -> Result<(), PlanConstraintViolation> {
        match self.violations().into_iter().next() {
            Some(v) => Err(v),
            None => Ok(()),
        }
    }

    /// Every violated invariant, in a fixed order.
    pub fn violations(&self) -> Vec<PlanConstraintViolation> {
        use PlanConstraintViolation as V;
        let mut out = Vec::new();

        if !self.layout.is_empty() && self.target_device.is_none() {
            out.push(V::NoTargetDevice);
        }

        let count_role = |role| self.layout.iter().filter(|e| e.spec.role == role).count();
        if count_role(PartitionRole::Boot) > 1 {
            out.push(V::MultipleBootPartitions);
        }
        if count_role(PartitionRole::Root) > 1 {
            out.push(V::MultipleRootPartitions);
        }
        let remainders = self
            .layout
            .iter()
            .filter(|e| e.spec.size == PartitionSize::Remaining)
            .count();
        if remainders > 1 {
            out.push(V::MultipleRemainderPartitions);
        }

        for entry in &self.layout {
            self.entry_violations(entry, &mut out);
        }

        let mut seen = HashSet::new();
        for (_, target) in self.mount_plan() {
            if let MountTarget::Path(path) = target {
                if !seen.insert(path.clone()) {
                    out.push(V::DuplicateMountPoint {
                        path: path.display().to_string(),
                    });
                }
            }
        }

        if let Some(device) = &self.target_device {
            let requested = self.requested_bytes();
            let usable = self.usable_bytes(device.capacity_bytes);
            if requested > usable {
                out.push(V::CapacityExceeded { requested, usable });
            }
        }

        if let Some(identity) = &self.identity {
            if let Err(v) = validate_identity(identity) {
                out.push(v);
            }
        }

        let mut names = HashSet::new();
        for user in &self.users {
            if let Err(reason) = validate_username(&user.name) {
                out.push(V::InvalidUsername {
                    name: user.name.clone(),
                    reason,
                });
            }
            if !names.insert(user.name.as_str()) {
                out.push(V::DuplicateUser {
                    name: user.name.clone(),
                });
            }
            if let AuthMethod::HashedPassword { hash } = &user.auth_method {
                if let Err(reason) = validate_password_hash(hash) {
                    out.push(V::InvalidPasswordHash {
                        name: user.name.clone(),
                        reason,
                    });
                }
            }
        }
        if let Some(hash) = &self.root_password_hash {
            if let Err(reason) = validate_password_hash(hash) {
                out.push(V::InvalidPasswordHash {
                    name: "root".to_string(),
                    reason,
                });
            }
        }

        let admins = self.admin_count();
        if admins > 1 && !self.admin_waived {
            out.push(V::AdminCount { found: admins });
        }

        if self.bootloader_target != BootloaderTarget::from(self.firmware)
            && !self.bootloader_override_confirmed
        {
            out.push(V::BootloaderOverrideUnconfirmed {
                firmware: self.firmware,
                requested: self.bootloader_target,
            });
        }

        out
    }

    fn entry_violations(&self, entry: &LayoutEntry, out: &mut Vec<PlanConstraintViolation>) {
        use PlanConstraintViolation as V;
        let spec = &entry.spec;

        if spec.size == PartitionSize::Exact(0) {
            out.push(V::ZeroSizedPartition { id: entry.id });
        }

        let incompatible = |reason| V::IncompatibleFilesystem {
            role: spec.role,
            filesystem: spec.filesystem,
            reason,
        };
        match spec.role {
            PartitionRole::Swap if spec.filesystem != Filesystem::Swap => {
                out.push(incompatible("swap partitions must use the swap filesystem"));
            }
            role if role != PartitionRole::Swap && spec.filesystem == Filesystem::Swap => {
                out.push(incompatible("only swap partitions may use the swap filesystem"));
            }
            PartitionRole::Boot
                if self.bootloader_target.is_uefi() && spec.filesystem != Filesystem::Fat32 =>
            {
                out.push(incompatible("the EFI System Partition must be FAT32"));
            }
            PartitionRole::Root if !spec.filesystem.supports_root() => {
                out.push(incompatible("root must be ext4, btrfs or xfs"));
            }
            _ => {}
        }

        match (spec.role, &spec.mount_point) {
            (PartitionRole::Custom, None) => out.push(V::MissingMountPoint { id: entry.id }),
            (PartitionRole::Custom, Some(path)) => {
                if !is_valid_mount_point(path) {
                    out.push(V::InvalidMountPoint {
                        path: path.display().to_string(),
                    });
                }
            }
            (role, Some(_)) => out.push(V::UnexpectedMountPoint { id: entry.id, role }),
            (_, None) => {}
        }
    }

    /// Re-resolve the target device against a (possibly newer) snapshot.
    pub fn resolve_against(&self, snapshot: &HardwareSnapshot) -> Result<(), PlanConstraintViolation> {
        let Some(target) = &self.target_device else {
            return Ok(());
        };
        let device = snapshot
            .device(&target.id)
            .ok_or_else(|| PlanConstraintViolation::TargetDeviceMissing {
                id: target.id.clone(),
            })?;
        match device.size_bytes {
            Some(now) if now == target.capacity_bytes => Ok(()),
            Some(now) => Err(PlanConstraintViolation::TargetDeviceChanged {
                id: target.id.clone(),
                was: target.capacity_bytes,
                now,
            }),
            None => Err(PlanConstraintViolation::DeviceSizeUnknown {
                id: target.id.clone(),
            }),
        }
    }

    /// Required fields that are still unset.
    pub fn missing_fields(&self) -> Vec<MissingField> {
        let mut missing = Vec::new();
        if self.target_device.is_none() {
            missing.push(MissingField::TargetDevice);
        }
        if self.partition_by_role(PartitionRole::Root).is_none() {
            missing.push(MissingField::RootPartition);
        }
        if self.bootloader_target.is_uefi() && self.partition_by_role(PartitionRole::Boot).is_none() {
            missing.push(MissingField::BootPartition);
        }
        if self.identity.is_none() {
            missing.push(MissingField::Identity);
        }
        if self.users.is_empty() {
            missing.push(MissingField::Users);
        }
        missing
    }

    // ------------------------------------------------------------------
    // Freezing
    // ------------------------------------------------------------------

    /// Produce the immutable plan handed to the execution engine.
    pub fn freeze(&self) -> Result<FrozenPlan, FreezeError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(IncompletePlanError { missing }.into());
        }
        self.check_invariants()?;
        if !self.admin_waived && self.admin_count() != 1 {
            return Err(PlanConstraintViolation::AdminCount {
                found: self.admin_count(),
            }
            .into());
        }

        let (Some(device), Some(identity)) = (&self.target_device, &self.identity) else {
            return Err(IncompletePlanError {
                missing: self.missing_fields(),
            }
            .into());
        };

        let disk = PathBuf::from(&device.id);
        let mut next_number = 1u32;
        let mut start_mib = 1u64;
        let bios_boot_partition = if self.bootloader_target.is_uefi() {
            None
        } else {
            let path = partition_path(&disk, next_number);
            next_number += 1;
            start_mib += BIOS_BOOT_PARTITION_SIZE / MIB;
            Some(path)
        };

        let remainder = self.remainder_bytes().unwrap_or(0);
        let mut partitions = Vec::with_capacity(self.layout.len());
        for entry in &self.layout {
            let size_bytes = match entry.spec.size {
                PartitionSize::Exact(bytes) => align_up_mib(bytes),
                PartitionSize::Remaining => remainder,
            };
            let mount = entry
                .spec
                .mount_target()
                .ok_or(PlanConstraintViolation::MissingMountPoint { id: entry.id })?;
            partitions.push(ResolvedPartition {
                id: entry.id,
                number: next_number,
                role: entry.spec.role,
                filesystem: entry.spec.filesystem,
                size_bytes,
                start_mib,
                device_path: partition_path(&disk, next_number),
                mount,
            });
            next_number += 1;
            start_mib += size_bytes / MIB;
        }

        Ok(FrozenPlan(Arc::new(PlanSnapshot {
            device_id: device.id.clone(),
            device_capacity: device.capacity_bytes,
            bios_boot_partition,
            partitions,
            identity: identity.clone(),
            users: self.users.clone(),
            root_password_hash: self.root_password_hash.clone(),
            bootloader_target: self.bootloader_target,
            admin_waived: self.admin_waived,
            frozen_at: crate::hardware::unix_now(),
        })))
    }
}

// ============================================================================
// FrozenPlan
// ============================================================================

/// A partition with concrete geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPartition {
    pub id: PartitionId,
    /// 1-based partition number on the disk
    pub number: u32,
    pub role: PartitionRole,
    pub filesystem: Filesystem,
    pub size_bytes: u64,
    pub start_mib: u64,
    pub device_path: PathBuf,
    pub mount: MountTarget,
}

impl ResolvedPartition {
    /// Short step label: the role, or the mount path for custom partitions.
    pub fn label(&self) -> String {
        match (&self.role, &self.mount) {
            (PartitionRole::Custom, MountTarget::Path(p)) => p.display().to_string(),
            (role, _) => role.to_string(),
        }
    }
}

/// Plain-data content of a frozen plan (also the journal's plan record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub device_id: String,
    pub device_capacity: u64,
    /// GRUB BIOS boot partition, present only for BIOS targets
    pub bios_boot_partition: Option<PathBuf>,
    pub partitions: Vec<ResolvedPartition>,
    pub identity: SystemIdentity,
    pub users: Vec<UserSpec>,
    #[serde(default)]
    pub root_password_hash: Option<String>,
    pub bootloader_target: BootloaderTarget,
    pub admin_waived: bool,
    pub frozen_at: u64,
}

impl PlanSnapshot {
    pub fn partition_by_role(&self, role: PartitionRole) -> Option<&ResolvedPartition> {
        self.partitions.iter().find(|p| p.role == role)
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!(
                "Target: {} ({}), bootloader: {}",
                self.device_id,
                format_bytes(self.device_capacity),
                self.bootloader_target
            ),
            format!(
                "Host: {} ({}, {})",
                self.identity.hostname, self.identity.locale, self.identity.timezone
            ),
        ];
        for part in &self.partitions {
            lines.push(format!(
                "  {} {} {} -> {}",
                part.device_path.display(),
                format_bytes(part.size_bytes),
                part.filesystem,
                part.mount
            ));
        }
        for user in &self.users {
            lines.push(format!(
                "  user {}{}",
                user.name,
                if user.is_admin { " (admin)" } else { "" }
            ));
        }
        lines.join("\n")
    }
}

/// Immutable plan shared between the engine and any observers.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenPlan(Arc<PlanSnapshot>);

impl FrozenPlan {
    /// Rebuild a frozen plan from a journal record.
    pub fn from_snapshot(snapshot: PlanSnapshot) -> Self {
        Self(Arc::new(snapshot))
    }

    pub fn snapshot(&self) -> &PlanSnapshot {
        &self.0
    }
}

impl Deref for FrozenPlan {
    type Target = PlanSnapshot;

    fn deref(&self) -> &PlanSnapshot {
        &self.0
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Generate a partition device path from a disk path and partition number.
///
/// Handles both `/dev/sdX` → `/dev/sdX1` and `/dev/nvme0n1` → `/dev/nvme0n1p1` patterns.
pub fn partition_path(disk: &Path, partition_num: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    // NVMe, mmcblk and loop devices use a 'p' separator
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, partition_num))
    } else {
        PathBuf::from(format!("{}{}", disk_str, partition_num))
    }
}

fn is_valid_mount_point(path: &Path) -> bool {
    path.is_absolute()
        && path != Path::new("/")
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

/// Validate a hostname as a single RFC 1123 label.
pub fn validate_hostname(hostname: &str) -> Result<(), &'static str> {
    if hostname.is_empty() || hostname.len() > 63 {
        return Err("must be 1-63 characters");
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err("only letters, digits and hyphens are allowed");
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err("cannot start or end with a hyphen");
    }
    Ok(())
}

/// Validate a login name the way `useradd` would accept it.
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.is_empty() || name.len() > 32 {
        return Err("must be 1-32 characters");
    }
    let mut chars = name.chars();
    if !chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
    {
        return Err("must start with a lowercase letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err("only lowercase letters, digits, '_' and '-' are allowed");
    }
    if RESERVED_USERNAMES.contains(&name) {
        return Err("name is reserved for a system account");
    }
    Ok(())
}

/// Check that `hash` looks like a crypt(3) `$id$...` string.
///
/// Plain-text passwords are never accepted into the plan; hash them with
/// `mkpasswd -m sha-512` first.
pub fn validate_password_hash(hash: &str) -> Result<(), &'static str> {
    if !hash.starts_with('$') {
        return Err("expected a crypt(3) hash such as the output of mkpasswd -m sha-512");
    }
    if hash.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err("hashes cannot contain whitespace or ':'");
    }
    let fields: Vec<&str> = hash.split('$').skip(1).collect();
    if fields.len() < 3 || fields.iter().any(|f| f.is_empty()) {
        return Err("expected $<scheme>$<salt>$<hash>");
    }
    Ok(())
}

fn validate_identity(identity: &SystemIdentity) -> Result<(), PlanConstraintViolation> {
    validate_hostname(&identity.hostname).map_err(|reason| {
        PlanConstraintViolation::InvalidHostname {
            hostname: identity.hostname.clone(),
            reason,
        }
    })?;

    let locale_ok = !identity.locale.is_empty()
        && identity
            .locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'));
    if !locale_ok {
        return Err(PlanConstraintViolation::InvalidLocale {
            locale: identity.locale.clone(),
        });
    }

    let tz = &identity.timezone;
    let tz_ok = !tz.is_empty()
        && !tz.starts_with('/')
        && !tz.ends_with('/')
        && !tz.contains("..")
        && tz
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'));
    if !tz_ok {
        return Err(PlanConstraintViolation::InvalidTimezone {
            timezone: tz.clone(),
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::BlockDevice;
    use crate::types::GIB;

    fn snapshot(firmware: FirmwareMode, disks: &[(&str, Option<u64>)]) -> HardwareSnapshot {
        let devices = disks
            .iter()
            .map(|(id, size)| BlockDevice {
                id: id.to_string(),
                size_bytes: *size,
                model: None,
                existing_partitions: Vec::new(),
                removable: false,
                degraded: size.is_none(),
                mount_point: None,
            })
            .collect();
        HardwareSnapshot::new(firmware, devices, Vec::new())
    }

    fn uefi_plan(capacity: u64) -> (InstallationPlan, HardwareSnapshot) {
        let snap = snapshot(FirmwareMode::Uefi, &[("/dev/sda", Some(capacity))]);
        let mut plan = InstallationPlan::for_snapshot(&snap);
        plan.set_target_device(&snap, "/dev/sda").expect("device exists"); // test: known device
        (plan, snap)
    }

    fn boot() -> PartitionSpec {
        PartitionSpec::new(PartitionRole::Boot, PartitionSize::mib(512), Filesystem::Fat32)
    }

    fn root() -> PartitionSpec {
        PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, Filesystem::Ext4)
    }

    fn admin(name: &str) -> UserSpec {
        UserSpec {
            name: name.to_string(),
            is_admin: true,
            auth_method: AuthMethod::SetAfterInstall,
        }
    }

    fn identity() -> SystemIdentity {
        SystemIdentity {
            hostname: "nixbox".to_string(),
            locale: "en_US.UTF-8".to_string(),
            timezone: "Europe/Berlin".to_string(),
        }
    }

    fn complete_plan() -> InstallationPlan {
        let (mut plan, _) = uefi_plan(20 * GIB);
        plan.add_partition(boot()).expect("boot fits"); // test: known-good layout
        plan.add_partition(root()).expect("root fits"); // test: known-good layout
        plan.set_identity(identity()).expect("valid identity"); // test: known-good identity
        plan.add_user(admin("alice")).expect("valid user"); // test: known-good user
        plan
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    #[test]
    fn test_second_boot_partition_rejected_and_plan_unchanged() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        plan.add_partition(boot()).expect("first boot fits"); // test: known-good layout
        let before = plan.clone();

        let err = plan.add_partition(boot()).unwrap_err();
        assert_eq!(err, PlanConstraintViolation::MultipleBootPartitions);
        assert!(err.to_string().contains("at most one boot partition"));
        assert_eq!(plan, before);
    }

    #[test]
    fn test_second_root_partition_rejected() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        plan.add_partition(root()).expect("root fits"); // test: known-good layout
        let second = PartitionSpec::new(PartitionRole::Root, PartitionSize::gib(2), Filesystem::Ext4);
        assert_eq!(
            plan.add_partition(second).unwrap_err(),
            PlanConstraintViolation::MultipleRootPartitions
        );
    }

    #[test]
    fn test_partitions_require_target_device() {
        let mut plan = InstallationPlan::new(FirmwareMode::Uefi);
        assert_eq!(
            plan.add_partition(boot()).unwrap_err(),
            PlanConstraintViolation::NoTargetDevice
        );
        assert!(plan.layout().is_empty());
    }

    #[test]
    fn test_capacity_exceeded_is_rejected() {
        let (mut plan, _) = uefi_plan(4 * GIB);
        let huge = PartitionSpec::new(PartitionRole::Root, PartitionSize::gib(8), Filesystem::Ext4);
        let err = plan.add_partition(huge).unwrap_err();
        assert!(matches!(err, PlanConstraintViolation::CapacityExceeded { .. }));
        assert!(err.to_string().contains("exceed device capacity"));
    }

    #[test]
    fn test_password_hashes_must_be_crypt_strings() {
        assert!(validate_password_hash("$6$salt$hash").is_ok());
        assert!(validate_password_hash("$6$rounds=5000$salt$hash").is_ok());
        assert!(validate_password_hash("$y$j9T$salt$hash").is_ok());
        assert!(validate_password_hash("hunter2").is_err());
        assert!(validate_password_hash("$6$$hash").is_err());
        assert!(validate_password_hash("$6$salt").is_err());
        assert!(validate_password_hash("$6$salt$ha sh").is_err());

        let (mut plan, _) = uefi_plan(20 * GIB);
        let before = plan.clone();
        let err = plan
            .set_root_password_hash(Some("hunter2".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            PlanConstraintViolation::InvalidPasswordHash { ref name, .. } if name == "root"
        ));
        assert_eq!(plan, before);
        assert!(!plan.has_login_credential());

        plan.set_root_password_hash(Some("$6$salt$hash".to_string()))
            .expect("well-formed hash"); // test: valid crypt string
        assert_eq!(plan.root_password_hash(), Some("$6$salt$hash"));
        assert!(plan.has_login_credential());

        let err = plan
            .add_user(UserSpec {
                name: "bob".to_string(),
                is_admin: false,
                auth_method: AuthMethod::HashedPassword {
                    hash: "plain".to_string(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, PlanConstraintViolation::InvalidPasswordHash { ref name, .. } if name == "bob"));
        assert!(plan.users().is_empty());
    }

    #[test]
    fn test_root_password_hash_is_frozen() {
        let mut plan = complete_plan();
        plan.set_root_password_hash(Some("$6$salt$hash".to_string()))
            .expect("hash"); // test: valid crypt string

        let frozen = plan.freeze().expect("complete plan"); // test: complete plan
        assert_eq!(frozen.snapshot().root_password_hash.as_deref(), Some("$6$salt$hash"));
    }

    #[test]
    fn test_sizes_near_u64_max_exceed_capacity() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        plan.add_partition(boot()).expect("boot fits"); // test: known-good layout
        let before = plan.clone();

        let huge = PartitionSpec::custom("/data", PartitionSize::Exact(u64::MAX), Filesystem::Ext4);
        let err = plan.add_partition(huge).unwrap_err();
        assert_eq!(
            err,
            PlanConstraintViolation::CapacityExceeded {
                requested: u64::MAX,
                usable: 20 * GIB - PARTITION_TABLE_OVERHEAD,
            }
        );
        assert_eq!(plan, before);

        // Would wrap once added to the boot partition
        let near_max = PartitionSpec::custom("/srv", PartitionSize::Exact(u64::MAX - 256 * MIB), Filesystem::Xfs);
        let err = plan.add_partition(near_max).unwrap_err();
        assert!(matches!(err, PlanConstraintViolation::CapacityExceeded { .. }));

        let swap = PartitionSpec::new(PartitionRole::Swap, PartitionSize::gib(u64::MAX), Filesystem::Swap);
        assert!(plan.add_partition(swap).is_err());
        assert_eq!(plan, before);
    }

    #[test]
    fn test_resize_checks_capacity_atomically() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let boot_id = plan.add_partition(boot()).expect("boot fits"); // test: known-good layout
        plan.add_partition(root()).expect("root fits"); // test: known-good layout
        let before = plan.clone();

        let err = plan.resize_partition(boot_id, PartitionSize::gib(64)).unwrap_err();
        assert!(matches!(err, PlanConstraintViolation::CapacityExceeded { .. }));
        assert_eq!(plan, before);

        plan.resize_partition(boot_id, PartitionSize::mib(1024)).expect("fits"); // test: fits on 20 GiB
        assert_eq!(plan.resolved_size(boot_id), Some(1024 * MIB));
    }

    #[test]
    fn test_remove_unknown_partition() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        assert_eq!(
            plan.remove_partition(42).unwrap_err(),
            PlanConstraintViolation::UnknownPartition { id: 42 }
        );
    }

    #[test]
    fn test_only_one_remainder() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        plan.add_partition(root()).expect("root fits"); // test: known-good layout
        let data = PartitionSpec::custom("/data", PartitionSize::Remaining, Filesystem::Xfs);
        assert_eq!(
            plan.add_partition(data).unwrap_err(),
            PlanConstraintViolation::MultipleRemainderPartitions
        );
    }

    #[test]
    fn test_filesystem_role_compatibility() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let ext4_esp = PartitionSpec::new(PartitionRole::Boot, PartitionSize::mib(512), Filesystem::Ext4);
        assert!(matches!(
            plan.add_partition(ext4_esp).unwrap_err(),
            PlanConstraintViolation::IncompatibleFilesystem { role: PartitionRole::Boot, .. }
        ));

        let ext4_swap = PartitionSpec::new(PartitionRole::Swap, PartitionSize::gib(1), Filesystem::Ext4);
        assert!(matches!(
            plan.add_partition(ext4_swap).unwrap_err(),
            PlanConstraintViolation::IncompatibleFilesystem { role: PartitionRole::Swap, .. }
        ));

        let fat_root = PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, Filesystem::Fat32);
        assert!(plan.add_partition(fat_root).is_err());
    }

    #[test]
    fn test_custom_mount_point_rules() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let relative = PartitionSpec::custom("data", PartitionSize::gib(1), Filesystem::Ext4);
        assert!(matches!(
            plan.add_partition(relative).unwrap_err(),
            PlanConstraintViolation::InvalidMountPoint { .. }
        ));

        let mut no_mount = PartitionSpec::custom("/data", PartitionSize::gib(1), Filesystem::Ext4);
        no_mount.mount_point = None;
        assert!(matches!(
            plan.add_partition(no_mount).unwrap_err(),
            PlanConstraintViolation::MissingMountPoint { .. }
        ));

        let mut root_with_mount = root();
        root_with_mount.mount_point = Some(PathBuf::from("/srv"));
        assert!(matches!(
            plan.add_partition(root_with_mount).unwrap_err(),
            PlanConstraintViolation::UnexpectedMountPoint { .. }
        ));

        plan.add_partition(boot()).expect("boot fits"); // test: known-good layout
        let shadow_boot = PartitionSpec::custom("/boot", PartitionSize::gib(1), Filesystem::Ext4);
        assert_eq!(
            plan.add_partition(shadow_boot).unwrap_err(),
            PlanConstraintViolation::DuplicateMountPoint {
                path: "/boot".to_string()
            }
        );
    }

    #[test]
    fn test_zero_size_rejected() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let zero = PartitionSpec::new(PartitionRole::Swap, PartitionSize::Exact(0), Filesystem::Swap);
        assert!(matches!(
            plan.add_partition(zero).unwrap_err(),
            PlanConstraintViolation::ZeroSizedPartition { .. }
        ));
    }

    #[test]
    fn test_unknown_and_degraded_devices() {
        let snap = snapshot(FirmwareMode::Uefi, &[("/dev/vda", None)]);
        let mut plan = InstallationPlan::for_snapshot(&snap);
        assert!(matches!(
            plan.set_target_device(&snap, "/dev/sdz").unwrap_err(),
            PlanConstraintViolation::UnknownDevice { .. }
        ));
        assert!(matches!(
            plan.set_target_device(&snap, "/dev/vda").unwrap_err(),
            PlanConstraintViolation::DeviceSizeUnknown { .. }
        ));
        assert!(plan.target_device().is_none());
    }

    #[test]
    fn test_switching_to_smaller_device_rechecks_capacity() {
        let snap = snapshot(
            FirmwareMode::Uefi,
            &[("/dev/sda", Some(20 * GIB)), ("/dev/sdb", Some(2 * GIB))],
        );
        let mut plan = InstallationPlan::for_snapshot(&snap);
        plan.set_target_device(&snap, "/dev/sda").expect("sda exists"); // test: known device
        plan.add_partition(PartitionSpec::new(PartitionRole::Root, PartitionSize::gib(10), Filesystem::Ext4))
            .expect("fits on sda"); // test: known-good layout

        assert!(matches!(
            plan.set_target_device(&snap, "/dev/sdb").unwrap_err(),
            PlanConstraintViolation::CapacityExceeded { .. }
        ));
        assert_eq!(plan.target_device().map(|d| d.id.as_str()), Some("/dev/sda"));
    }

    #[test]
    fn test_user_rules() {
        let mut plan = InstallationPlan::new(FirmwareMode::Uefi);
        plan.add_user(admin("alice")).expect("valid user"); // test: known-good user
        assert_eq!(
            plan.add_user(admin("alice")).unwrap_err(),
            PlanConstraintViolation::DuplicateUser {
                name: "alice".to_string()
            }
        );
        assert_eq!(
            plan.add_user(admin("bob")).unwrap_err(),
            PlanConstraintViolation::AdminCount { found: 2 }
        );
        assert!(matches!(
            plan.add_user(admin("Root")).unwrap_err(),
            PlanConstraintViolation::InvalidUsername { .. }
        ));
        assert!(matches!(
            plan.add_user(admin("root")).unwrap_err(),
            PlanConstraintViolation::InvalidUsername { .. }
        ));

        plan.set_admin_waiver(true).expect("waiver"); // test: always valid
        plan.add_user(admin("bob")).expect("second admin allowed with waiver"); // test: waived
        assert_eq!(
            plan.set_admin_waiver(false).unwrap_err(),
            PlanConstraintViolation::AdminCount { found: 2 }
        );

        plan.remove_user("bob").expect("bob exists"); // test: known user
        assert!(matches!(
            plan.remove_user("carol").unwrap_err(),
            PlanConstraintViolation::UnknownUser { .. }
        ));
    }

    #[test]
    fn test_identity_validation() {
        let mut plan = InstallationPlan::new(FirmwareMode::Bios);
        let mut bad = identity();
        bad.hostname = "-nix".to_string();
        assert!(matches!(
            plan.set_identity(bad).unwrap_err(),
            PlanConstraintViolation::InvalidHostname { .. }
        ));

        let mut bad = identity();
        bad.timezone = "../etc/passwd".to_string();
        assert!(matches!(
            plan.set_identity(bad).unwrap_err(),
            PlanConstraintViolation::InvalidTimezone { .. }
        ));

        let mut bad = identity();
        bad.locale = "en US".to_string();
        assert!(matches!(
            plan.set_identity(bad).unwrap_err(),
            PlanConstraintViolation::InvalidLocale { .. }
        ));
        assert!(plan.identity().is_none());

        plan.set_identity(identity()).expect("valid identity"); // test: known-good identity
    }

    #[test]
    fn test_bootloader_override_needs_confirmation() {
        let mut plan = InstallationPlan::new(FirmwareMode::Uefi);
        assert_eq!(plan.bootloader_target(), BootloaderTarget::Uefi);
        assert!(matches!(
            plan.set_bootloader_target(BootloaderTarget::Bios, false).unwrap_err(),
            PlanConstraintViolation::BootloaderOverrideUnconfirmed { .. }
        ));
        assert_eq!(plan.bootloader_target(), BootloaderTarget::Uefi);

        plan.set_bootloader_target(BootloaderTarget::Bios, true).expect("confirmed"); // test: confirmed override
        assert_eq!(plan.bootloader_target(), BootloaderTarget::Bios);
        // Matching the firmware never needs confirmation
        plan.set_bootloader_target(BootloaderTarget::Uefi, false).expect("default target"); // test: firmware default
    }

    #[test]
    fn test_mount_plan_is_derived_from_layout() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let b = plan.add_partition(boot()).expect("boot"); // test: known-good layout
        let s = plan
            .add_partition(PartitionSpec::new(PartitionRole::Swap, PartitionSize::gib(2), Filesystem::Swap))
            .expect("swap"); // test: known-good layout
        let r = plan.add_partition(root()).expect("root"); // test: known-good layout

        assert_eq!(
            plan.mount_plan(),
            vec![
                (b, MountTarget::Path(PathBuf::from("/boot"))),
                (s, MountTarget::Swap),
                (r, MountTarget::Path(PathBuf::from("/"))),
            ]
        );

        plan.remove_partition(s).expect("swap exists"); // test: known partition
        assert_eq!(plan.mount_plan().len(), plan.layout().len());
    }

    // =========================================================================
    // Freezing
    // =========================================================================

    #[test]
    fn test_freeze_complete_uefi_plan() {
        let frozen = complete_plan().freeze().expect("complete plan freezes"); // test: complete plan

        assert_eq!(frozen.device_id, "/dev/sda");
        assert_eq!(frozen.bios_boot_partition, None);
        assert_eq!(frozen.partitions.len(), 2);

        let boot = &frozen.partitions[0];
        assert_eq!(boot.number, 1);
        assert_eq!(boot.start_mib, 1);
        assert_eq!(boot.size_bytes, 512 * MIB);
        assert_eq!(boot.device_path, PathBuf::from("/dev/sda1"));

        let root = &frozen.partitions[1];
        assert_eq!(root.number, 2);
        assert_eq!(root.start_mib, 513);
        assert_eq!(root.size_bytes, 20 * GIB - 2 * MIB - 512 * MIB);
        assert_eq!(root.mount, MountTarget::Path(PathBuf::from("/")));
    }

    #[test]
    fn test_freeze_bios_reserves_bios_boot_partition() {
        let snap = snapshot(FirmwareMode::Bios, &[("/dev/nvme0n1", Some(20 * GIB))]);
        let mut plan = InstallationPlan::for_snapshot(&snap);
        plan.set_target_device(&snap, "/dev/nvme0n1").expect("device"); // test: known device
        plan.add_partition(root()).expect("root"); // test: known-good layout
        plan.set_identity(identity()).expect("identity"); // test: known-good identity
        plan.add_user(admin("alice")).expect("user"); // test: known-good user

        let frozen = plan.freeze().expect("bios plan freezes"); // test: complete plan
        assert_eq!(frozen.bios_boot_partition, Some(PathBuf::from("/dev/nvme0n1p1")));
        assert_eq!(frozen.partitions[0].device_path, PathBuf::from("/dev/nvme0n1p2"));
        assert_eq!(frozen.partitions[0].start_mib, 2);
    }

    #[test]
    fn test_freeze_reports_missing_fields() {
        let plan = InstallationPlan::new(FirmwareMode::Uefi);
        let err = plan.freeze().unwrap_err();
        assert_eq!(
            err,
            FreezeError::Incomplete(IncompletePlanError {
                missing: vec![
                    MissingField::TargetDevice,
                    MissingField::RootPartition,
                    MissingField::BootPartition,
                    MissingField::Identity,
                    MissingField::Users,
                ]
            })
        );
        assert!(err.to_string().contains("missing target device"));
    }

    #[test]
    fn test_freeze_requires_an_admin() {
        let mut plan = complete_plan();
        plan.remove_user("alice").expect("alice exists"); // test: known user
        plan.add_user(UserSpec {
            name: "bob".to_string(),
            is_admin: false,
            auth_method: AuthMethod::SetAfterInstall,
        })
        .expect("non-admin user"); // test: known-good user

        assert_eq!(
            plan.freeze().unwrap_err(),
            FreezeError::Constraint(PlanConstraintViolation::AdminCount { found: 0 })
        );

        plan.set_admin_waiver(true).expect("waiver"); // test: always valid
        assert!(plan.freeze().is_ok());
    }

    #[test]
    fn test_frozen_plan_is_independent_of_later_edits() {
        let mut plan = complete_plan();
        let frozen = plan.freeze().expect("freezes"); // test: complete plan
        plan.remove_user("alice").expect("alice exists"); // test: known user
        assert_eq!(frozen.users.len(), 1);

        let copy = frozen.clone();
        assert_eq!(copy, frozen);
    }

    #[test]
    fn test_resolve_against_new_snapshot() {
        let plan = complete_plan();
        let same = snapshot(FirmwareMode::Uefi, &[("/dev/sda", Some(20 * GIB))]);
        assert!(plan.resolve_against(&same).is_ok());

        let gone = snapshot(FirmwareMode::Uefi, &[("/dev/sdb", Some(20 * GIB))]);
        assert!(matches!(
            plan.resolve_against(&gone).unwrap_err(),
            PlanConstraintViolation::TargetDeviceMissing { .. }
        ));

        let shrunk = snapshot(FirmwareMode::Uefi, &[("/dev/sda", Some(10 * GIB))]);
        assert!(matches!(
            plan.resolve_against(&shrunk).unwrap_err(),
            PlanConstraintViolation::TargetDeviceChanged { .. }
        ));
    }

    #[test]
    fn test_replace_layout_is_atomic() {
        let (mut plan, _) = uefi_plan(20 * GIB);
        let ids = plan
            .replace_layout(InstallationPlan::default_layout(BootloaderTarget::Uefi, Some(2)))
            .expect("default layout fits"); // test: known-good layout
        assert_eq!(ids, vec![1, 2, 3]);

        let before = plan.clone();
        let err = plan.replace_layout(vec![boot(), boot(), root()]).unwrap_err();
        assert_eq!(err, PlanConstraintViolation::MultipleBootPartitions);
        assert_eq!(plan, before);

        // Ids are never reused
        let ids = plan.replace_layout(vec![boot(), root()]).expect("fits"); // test: known-good layout
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn test_default_layout() {
        let uefi = InstallationPlan::default_layout(BootloaderTarget::Uefi, Some(4));
        let roles: Vec<PartitionRole> = uefi.iter().map(|s| s.role).collect();
        assert_eq!(roles, vec![PartitionRole::Boot, PartitionRole::Swap, PartitionRole::Root]);

        let bios = InstallationPlan::default_layout(BootloaderTarget::Bios, None);
        assert_eq!(bios.len(), 1);
        assert_eq!(bios[0].size, PartitionSize::Remaining);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn test_partition_path_sda() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
    }

    #[test]
    fn test_partition_path_nvme() {
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 1),
            PathBuf::from("/dev/mmcblk0p1")
        );
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("nixos").is_ok());
        assert!(validate_hostname("web-01").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("has.dot").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_partition_size_serde_shape() {
        let json = serde_json::to_string(&PartitionSize::mib(1)).expect("serialize"); // test: plain enum
        assert_eq!(json, r#"{"exact":1048576}"#);
        let rem: PartitionSize = serde_json::from_str(r#""remaining""#).expect("parse"); // test: literal
        assert_eq!(rem, PartitionSize::Remaining);
    }
}
