//! Type-safe plan vocabulary shared across the installer.
//!
//! These enums replace stringly-typed choices (filesystem names, partition roles,
//! bootloader targets) with exhaustive Rust types. They serialize to the same
//! lowercase strings used in answers files and session journals.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Filesystem kind for a planned partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Filesystem {
    /// FAT32, required for the EFI System Partition
    Fat32,
    Ext4,
    Btrfs,
    Xfs,
    /// Linux swap area (not mountable)
    Swap,
}

impl Filesystem {
    /// Filesystem type name as reported by `lsblk` / `blkid`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fat32 => "vfat",
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Xfs => "xfs",
            Self::Swap => "swap",
        }
    }

    /// Whether the filesystem can be mounted into the target tree.
    pub fn is_mountable(self) -> bool {
        !matches!(self, Self::Swap)
    }

    /// Whether a NixOS root filesystem may live on this kind.
    pub fn supports_root(self) -> bool {
        matches!(self, Self::Ext4 | Self::Btrfs | Self::Xfs)
    }
}

/// Role a partition plays in the installed system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    Boot,
    Swap,
    Root,
    /// User-defined partition mounted at an explicit path
    Custom,
}

impl PartitionRole {
    /// GPT partition type code understood by `sgdisk --typecode`.
    pub fn gpt_type_code(self, target: BootloaderTarget) -> &'static str {
        match (self, target) {
            (Self::Boot, BootloaderTarget::Uefi) => "EF00",
            (Self::Boot, BootloaderTarget::Bios) => "8300",
            (Self::Swap, _) => "8200",
            (Self::Root, _) => "8304",
            (Self::Custom, _) => "8300",
        }
    }
}

/// Where the bootloader gets installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum BootloaderTarget {
    #[strum(to_string = "BIOS", serialize = "bios")]
    Bios,
    #[strum(to_string = "UEFI", serialize = "uefi")]
    Uefi,
}

impl BootloaderTarget {
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl From<crate::hardware::FirmwareMode> for BootloaderTarget {
    fn from(mode: crate::hardware::FirmwareMode) -> Self {
        match mode {
            crate::hardware::FirmwareMode::Uefi => Self::Uefi,
            crate::hardware::FirmwareMode::Bios => Self::Bios,
        }
    }
}

/// Round a byte count up to a whole number of mebibytes.
///
/// Saturates at `u64::MAX`, which no device can satisfy.
pub fn align_up_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).saturating_mul(MIB)
}

/// Format a byte count for display ("512 MiB", "20.0 GiB").
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{} B", bytes)
    }
}
