//! Pre-flight sanity checks for the runtime environment
//!
//! Verified before any installation starts:
//! - Required tools are present (the base set plus one `mkfs.*` per planned filesystem)
//! - Running with root privileges (EUID 0)
//!
//! A failed check is reported as a multi-line message naming the nixpkgs
//! package that provides each missing tool.

use crate::process_guard::CommandProcessGroup;
use crate::tool_args::ToolArgs;
use crate::tools::disk::MkfsArgs;
use crate::types::Filesystem;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Operator-facing explanation of every failed check.
    pub fn report(&self) -> String {
        let mut lines = vec!["Pre-flight check failed".to_string()];

        if !self.is_root {
            lines.push(String::new());
            lines.push("Root privileges required: partitioning and mounting need EUID 0.".to_string());
            lines.push("  Run with: sudo nixtui ...".to_string());
        }

        if !self.missing_binaries.is_empty() {
            lines.push(String::new());
            lines.push("Missing required tools:".to_string());
            for binary in &self.missing_binaries {
                lines.push(format!("  - {} (nixpkgs: {})", binary, package_for_binary(binary)));
            }
            let mut packages: Vec<&str> = self
                .missing_binaries
                .iter()
                .map(|b| package_for_binary(b))
                .collect();
            packages.sort_unstable();
            packages.dedup();
            lines.push(String::new());
            lines.push(format!("  Get them with: nix-shell -p {}", packages.join(" ")));
        }

        lines.join("\n")
    }
}

/// Tools every installation runs
const REQUIRED_BINARIES: &[&str] = &[
    "lsblk",
    "wipefs",
    "sgdisk",
    "partprobe",
    "mount",
    "umount",
    "nixos-generate-config",
    "nixos-install",
    "nixos-enter",
];

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return PathBuf::from(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_process_group()
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Tools needed for a plan using `filesystems`.
pub fn required_binaries(filesystems: &[Filesystem]) -> Vec<&'static str> {
    let mut binaries: Vec<&'static str> = REQUIRED_BINARIES.to_vec();
    for fs in filesystems {
        let program = MkfsArgs {
            device: PathBuf::new(),
            filesystem: *fs,
            label: None,
        }
        .program();
        if !binaries.contains(&program) {
            binaries.push(program);
        }
        if *fs == Filesystem::Swap && !binaries.contains(&"swapon") {
            binaries.push("swapon");
            binaries.push("swapoff");
        }
    }
    binaries
}

/// Perform all sanity checks and return the result
pub fn verify_environment(filesystems: &[Filesystem]) -> SanityCheckResult {
    let missing = required_binaries(filesystems)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .map(str::to_string)
        .collect();

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to the nixpkgs attribute providing them
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "lsblk" | "wipefs" | "mount" | "umount" | "swapon" | "swapoff" | "mkswap" => "util-linux",
        "sgdisk" => "gptfdisk",
        "partprobe" => "parted",
        "mkfs.fat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.btrfs" => "btrfs-progs",
        "mkfs.xfs" => "xfsprogs",
        "nixos-generate-config" | "nixos-install" | "nixos-enter" => "nixos-install-tools",
        _ => "unknown",
    }
}

/// Skip root check (for development/testing)
/// Set NIXTUI_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("NIXTUI_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run pre-flight checks; `Err` carries the operator-facing report.
pub fn run_preflight_checks(filesystems: &[Filesystem], skip_root: bool) -> Result<(), String> {
    tracing::debug!(skip_root, "running pre-flight sanity checks");

    let mut result = verify_environment(filesystems);
    if skip_root || should_skip_root_check() {
        tracing::warn!("root check skipped (NIXTUI_SKIP_ROOT_CHECK=1)");
        result.is_root = true;
    }

    if !result.is_ok() {
        return Err(result.report());
    }

    tracing::info!("pre-flight checks passed");
    Ok(())
}
