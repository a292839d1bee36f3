//! `configuration.nix` rendering for the installed system.
//!
//! The generated file only carries what the plan decided: bootloader, host
//! identity, users and the state version. Hardware details stay in the
//! `hardware-configuration.nix` produced by `nixos-generate-config`.

use crate::engine::EngineSettings;
use crate::plan::{AuthMethod, PlanSnapshot};
use crate::types::BootloaderTarget;

/// Quote a string as a Nix string literal.
pub fn nix_string(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "\\${");
    format!("\"{}\"", escaped)
}

pub fn render_configuration(plan: &PlanSnapshot, settings: &EngineSettings) -> String {
    let mut lines = vec![
        "# Generated by nixtui. Edit freely; rebuild with `nixos-rebuild switch`.".to_string(),
        "{ config, pkgs, ... }:".to_string(),
        String::new(),
        "{".to_string(),
        "  imports = [ ./hardware-configuration.nix ];".to_string(),
        String::new(),
    ];

    match plan.bootloader_target {
        BootloaderTarget::Uefi => {
            lines.push("  boot.loader.systemd-boot.enable = true;".to_string());
            lines.push("  boot.loader.efi.canTouchEfiVariables = true;".to_string());
        }
        BootloaderTarget::Bios => {
            lines.push("  boot.loader.grub.enable = true;".to_string());
            lines.push(format!(
                "  boot.loader.grub.device = {};",
                nix_string(&plan.device_id)
            ));
        }
    }
    lines.push(String::new());

    lines.push(format!(
        "  networking.hostName = {};",
        nix_string(&plan.identity.hostname)
    ));
    lines.push("  networking.networkmanager.enable = true;".to_string());
    lines.push(format!("  time.timeZone = {};", nix_string(&plan.identity.timezone)));
    lines.push(format!(
        "  i18n.defaultLocale = {};",
        nix_string(&plan.identity.locale)
    ));
    lines.push(String::new());

    for user in &plan.users {
        lines.push(format!("  users.users.{} = {{", nix_string(&user.name)));
        lines.push("    isNormalUser = true;".to_string());
        if user.is_admin {
            lines.push("    extraGroups = [ \"wheel\" \"networkmanager\" ];".to_string());
        } else {
            lines.push("    extraGroups = [ \"networkmanager\" ];".to_string());
        }
        match &user.auth_method {
            AuthMethod::HashedPassword { hash } => {
                lines.push(format!("    hashedPassword = {};", nix_string(hash)));
            }
            AuthMethod::AuthorizedKeys { keys } => {
                let keys: Vec<String> = keys.iter().map(|k| nix_string(k)).collect();
                lines.push(format!(
                    "    openssh.authorizedKeys.keys = [ {} ];",
                    keys.join(" ")
                ));
            }
            // Locked until a password is set from the installed system
            AuthMethod::SetAfterInstall => {}
        }
        lines.push("  };".to_string());
    }
    if let Some(hash) = &plan.root_password_hash {
        lines.push(format!("  users.users.root.hashedPassword = {};", nix_string(hash)));
    }
    // An admin who only has SSH keys has no password to give sudo
    let key_only_admin = plan
        .users
        .iter()
        .any(|u| u.is_admin && matches!(u.auth_method, AuthMethod::AuthorizedKeys { .. }));
    if key_only_admin {
        lines.push("  security.sudo.wheelNeedsPassword = false;".to_string());
    }

    let wants_ssh = plan
        .users
        .iter()
        .any(|u| matches!(u.auth_method, AuthMethod::AuthorizedKeys { .. }));
    if wants_ssh {
        lines.push(String::new());
        lines.push("  services.openssh.enable = true;".to_string());
        lines.push("  services.openssh.settings.PasswordAuthentication = false;".to_string());
    }

    lines.push(String::new());
    lines.push(format!(
        "  system.stateVersion = {};",
        nix_string(&settings.state_version)
    ));
    lines.push("}".to_string());

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
