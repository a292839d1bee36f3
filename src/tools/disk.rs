//! Type-safe arguments for disk tools.
//!
//! - [`WipeSignaturesArgs`] for `wipefs`
//! - [`PartitionTableArgs`] for `sgdisk`
//! - [`PartprobeArgs`] for `partprobe`
//! - [`MkfsArgs`] for `mkfs.fat` / `mkfs.ext4` / `mkfs.btrfs` / `mkfs.xfs` / `mkswap`
//! - [`MountArgs`], [`UnmountArgs`], [`SwaponArgs`], [`SwapoffArgs`]

use crate::tool_args::ToolArgs;
use crate::types::Filesystem;
use std::path::PathBuf;

/// Erase all filesystem, RAID and partition-table signatures from a device.
///
/// # Field to Flag Mapping
///
/// | Rust Field | CLI Flag | Notes |
/// |------------|----------|-------|
/// | `device`   | positional | disk or partition |
/// | (implied)  | `--all`  | wipe every signature found |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeSignaturesArgs {
    pub device: PathBuf,
}

impl ToolArgs for WipeSignaturesArgs {
    fn program(&self) -> &'static str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--all".to_string(), self.device.display().to_string()]
    }
}

/// One GPT entry created by [`PartitionTableArgs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptPartition {
    pub number: u32,
    pub start_mib: u64,
    pub size_mib: u64,
    /// sgdisk type code (`EF00`, `8304`, ...)
    pub type_code: &'static str,
    pub name: String,
}

/// Write a fresh GPT with the given partitions in a single `sgdisk` call.
///
/// Output: `sgdisk --clear -n 1:1M:+512M -t 1:EF00 -c 1:boot ... /dev/sda`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTableArgs {
    pub disk: PathBuf,
    pub partitions: Vec<GptPartition>,
}

impl ToolArgs for PartitionTableArgs {
    fn program(&self) -> &'static str {
        "sgdisk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["--clear".to_string()];
        for p in &self.partitions {
            args.push("-n".to_string());
            args.push(format!("{}:{}M:+{}M", p.number, p.start_mib, p.size_mib));
            args.push("-t".to_string());
            args.push(format!("{}:{}", p.number, p.type_code));
            args.push("-c".to_string());
            args.push(format!("{}:{}", p.number, p.name));
        }
        args.push(self.disk.display().to_string());
        args
    }
}

/// Ask the kernel to re-read a disk's partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartprobeArgs {
    pub disk: PathBuf,
}

impl ToolArgs for PartprobeArgs {
    fn program(&self) -> &'static str {
        "partprobe"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.disk.display().to_string()]
    }
}

/// Create a filesystem (or swap area) on a partition.
///
/// | Filesystem | Program      | Force flag | Label flag |
/// |------------|--------------|------------|------------|
/// | fat32      | `mkfs.fat`   | `-F 32`    | `-n`       |
/// | ext4       | `mkfs.ext4`  | `-F`       | `-L`       |
/// | btrfs      | `mkfs.btrfs` | `-f`       | `-L`       |
/// | xfs        | `mkfs.xfs`   | `-f`       | `-L`       |
/// | swap       | `mkswap`     | `-f`       | `-L`       |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkfsArgs {
    pub device: PathBuf,
    pub filesystem: Filesystem,
    pub label: Option<String>,
}

impl MkfsArgs {
    /// FAT volume labels are limited to 11 characters and conventionally upper case
    fn fat_label(label: &str) -> String {
        label.to_uppercase().chars().take(11).collect()
    }
}

impl ToolArgs for MkfsArgs {
    fn program(&self) -> &'static str {
        match self.filesystem {
            Filesystem::Fat32 => "mkfs.fat",
            Filesystem::Ext4 => "mkfs.ext4",
            Filesystem::Btrfs => "mkfs.btrfs",
            Filesystem::Xfs => "mkfs.xfs",
            Filesystem::Swap => "mkswap",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.filesystem {
            Filesystem::Fat32 => vec!["-F".into(), "32".into()],
            Filesystem::Ext4 => vec!["-F".into()],
            Filesystem::Btrfs | Filesystem::Xfs | Filesystem::Swap => vec!["-f".into()],
        };
        if let Some(label) = &self.label {
            match self.filesystem {
                Filesystem::Fat32 => {
                    args.push("-n".into());
                    args.push(Self::fat_label(label));
                }
                _ => {
                    args.push("-L".into());
                    args.push(label.clone());
                }
            }
        }
        args.push(self.device.display().to_string());
        args
    }
}

/// Mount a partition at a path on the live system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub device: PathBuf,
    pub target: PathBuf,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.device.display().to_string(),
            self.target.display().to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountArgs {
    pub target: PathBuf,
}

impl ToolArgs for UnmountArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwaponArgs {
    pub device: PathBuf,
}

impl ToolArgs for SwaponArgs {
    fn program(&self) -> &'static str {
        "swapon"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapoffArgs {
    pub device: PathBuf,
}

impl ToolArgs for SwapoffArgs {
    fn program(&self) -> &'static str {
        "swapoff"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipefs_uses_all_flag() {
        let args = WipeSignaturesArgs {
            device: PathBuf::from("/dev/sda"),
        };
        assert_eq!(args.to_command().to_string(), "wipefs --all /dev/sda");
    }

    #[test]
    fn test_sgdisk_builds_one_call_for_all_partitions() {
        let args = PartitionTableArgs {
            disk: PathBuf::from("/dev/nvme0n1"),
            partitions: vec![
                GptPartition {
                    number: 1,
                    start_mib: 1,
                    size_mib: 512,
                    type_code: "EF00",
                    name: "boot".to_string(),
                },
                GptPartition {
                    number: 2,
                    start_mib: 513,
                    size_mib: 19_965,
                    type_code: "8304",
                    name: "root".to_string(),
                },
            ],
        };
        let cli = args.to_cli_args();
        assert_eq!(cli[0], "--clear");
        assert_eq!(cli[1..7], ["-n", "1:1M:+512M", "-t", "1:EF00", "-c", "1:boot"]);
        assert_eq!(cli[8], "2:513M:+19965M");
        assert_eq!(cli.last().map(String::as_str), Some("/dev/nvme0n1"));
    }

    #[test]
    fn test_mkfs_program_and_flags_per_filesystem() {
        let mk = |filesystem, label: Option<&str>| MkfsArgs {
            device: PathBuf::from("/dev/sda1"),
            filesystem,
            label: label.map(str::to_string),
        };

        let fat = mk(Filesystem::Fat32, Some("boot"));
        assert_eq!(fat.program(), "mkfs.fat");
        assert_eq!(fat.to_cli_args(), vec!["-F", "32", "-n", "BOOT", "/dev/sda1"]);

        let ext4 = mk(Filesystem::Ext4, Some("nixos"));
        assert_eq!(ext4.program(), "mkfs.ext4");
        assert_eq!(ext4.to_cli_args(), vec!["-F", "-L", "nixos", "/dev/sda1"]);

        let swap = mk(Filesystem::Swap, None);
        assert_eq!(swap.program(), "mkswap");
        assert_eq!(swap.to_cli_args(), vec!["-f", "/dev/sda1"]);

        assert_eq!(mk(Filesystem::Btrfs, None).program(), "mkfs.btrfs");
        assert_eq!(mk(Filesystem::Xfs, None).program(), "mkfs.xfs");
    }

    #[test]
    fn test_fat_label_is_truncated() {
        assert_eq!(MkfsArgs::fat_label("efi-system-partition"), "EFI-SYSTEM-");
    }

    #[test]
    fn test_mount_and_swap_args() {
        let mount = MountArgs {
            device: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/mnt"),
        };
        assert_eq!(mount.to_command().to_string(), "mount /dev/sda2 /mnt");

        let umount = UnmountArgs {
            target: PathBuf::from("/mnt/boot"),
        };
        assert_eq!(umount.to_command().to_string(), "umount /mnt/boot");

        let on = SwaponArgs {
            device: PathBuf::from("/dev/sda2"),
        };
        let off = SwapoffArgs {
            device: PathBuf::from("/dev/sda2"),
        };
        assert_eq!(on.program(), "swapon");
        assert_eq!(off.to_cli_args(), vec!["/dev/sda2"]);
    }
}
