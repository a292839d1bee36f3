//! Type-safe arguments for NixOS tooling and user hooks.
//!
//! - [`GenerateConfigArgs`] for `nixos-generate-config`
//! - [`NixosInstallArgs`] for `nixos-install`
//! - [`InstallBootloaderArgs`] for `nixos-enter ... switch-to-configuration boot`
//! - [`HookArgs`] for pre/post-install hook scripts

use crate::tool_args::ToolArgs;
use std::path::PathBuf;

/// Detect hardware and print `hardware-configuration.nix` to stdout.
///
/// The installer writes both configuration files itself, so only
/// `--show-hardware-config` is used; nothing is written by the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateConfigArgs {
    pub root: PathBuf,
}

impl ToolArgs for GenerateConfigArgs {
    fn program(&self) -> &'static str {
        "nixos-generate-config"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--root".to_string(),
            self.root.display().to_string(),
            "--show-hardware-config".to_string(),
        ]
    }
}

/// Build the system closure and copy it into the target root.
///
/// # Field to Flag Mapping
///
/// | Rust Field        | CLI Flag |
/// |-------------------|----------|
/// | `root`            | `--root <path>` |
/// | (implied)         | `--no-root-passwd` (root password is never prompted) |
/// | (implied)         | `--no-bootloader` (installed by its own step) |
/// | `no_channel_copy` | `--no-channel-copy` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NixosInstallArgs {
    pub root: PathBuf,
    pub no_channel_copy: bool,
}

impl ToolArgs for NixosInstallArgs {
    fn program(&self) -> &'static str {
        "nixos-install"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            self.root.display().to_string(),
            "--no-root-passwd".to_string(),
            "--no-bootloader".to_string(),
        ];
        if self.no_channel_copy {
            args.push("--no-channel-copy".to_string());
        }
        args
    }
}

/// Install the bootloader of the freshly built system from inside the target.
///
/// # Environment Contract
///
/// `switch-to-configuration` only writes the bootloader when
/// `NIXOS_INSTALL_BOOTLOADER=1` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallBootloaderArgs {
    pub root: PathBuf,
}

impl ToolArgs for InstallBootloaderArgs {
    fn program(&self) -> &'static str {
        "nixos-enter"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--root".to_string(),
            self.root.display().to_string(),
            "--".to_string(),
            "/run/current-system/bin/switch-to-configuration".to_string(),
            "boot".to_string(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![("NIXOS_INSTALL_BOOTLOADER".to_string(), "1".to_string())]
    }
}

/// A user-provided hook script, run through `sh`.
///
/// # Environment Contract
///
/// | Variable               | Value |
/// |------------------------|-------|
/// | `INSTALLER_HOST_NAME`  | planned hostname |
/// | `INSTALLER_DISK`       | target disk path |
/// | `INSTALLER_MOUNT_ROOT` | where the target is mounted (`/mnt`) |
/// | `INSTALLER_CONFIG_DIR` | generated configuration directory |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookArgs {
    pub script: PathBuf,
    pub host_name: String,
    pub disk: String,
    pub mount_root: PathBuf,
    pub config_dir: PathBuf,
}

impl ToolArgs for HookArgs {
    fn program(&self) -> &'static str {
        "sh"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.script.display().to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("INSTALLER_HOST_NAME".to_string(), self.host_name.clone()),
            ("INSTALLER_DISK".to_string(), self.disk.clone()),
            (
                "INSTALLER_MOUNT_ROOT".to_string(),
                self.mount_root.display().to_string(),
            ),
            (
                "INSTALLER_CONFIG_DIR".to_string(),
                self.config_dir.display().to_string(),
            ),
        ]
    }
}
