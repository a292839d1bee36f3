//! Answers files for headless installations.
//!
//! An answers file records every decision a user would make interactively.
//! The headless installer replays it stage by stage through the same
//! validated [`Decision`]s the presentation layer sends, so a file can never
//! produce a plan the interactive flow would reject.
//!
//! ```json
//! {
//!   "device": "/dev/nvme0n1",
//!   "layout": { "kind": "default", "swap_gib": 4 },
//!   "hostname": "nixbox",
//!   "users": [
//!     { "name": "alice", "is_admin": true,
//!       "auth_method": { "kind": "authorized_keys", "keys": ["ssh-ed25519 AAAA..."] } }
//!   ],
//!   "root_password_hash": "$6$..."
//! }
//! ```

use crate::config::Defaults;
use crate::install_state::{Decision, Stage};
use crate::plan::{PartitionSpec, SystemIdentity, UserSpec};
use crate::types::BootloaderTarget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the target disk is laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutChoice {
    /// EFI (UEFI only) + optional swap + root on the rest
    Default {
        #[serde(default)]
        swap_gib: Option<u64>,
    },
    /// Explicit partitions, in disk order
    Custom { partitions: Vec<PartitionSpec> },
}

impl Default for LayoutChoice {
    fn default() -> Self {
        Self::Default { swap_gib: None }
    }
}

/// Bootloader override; must be confirmed when it differs from the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootloaderChoice {
    pub target: BootloaderTarget,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub device: String,
    #[serde(default)]
    pub layout: LayoutChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<BootloaderChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub users: Vec<UserSpec>,
    /// crypt(3) hash, e.g. from `mkpasswd -m sha-512`; root stays locked without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password_hash: Option<String>,
    #[serde(default)]
    pub waive_admin_requirement: bool,
}

impl PlanFile {
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize answers file to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write answers file to {:?}", path.as_ref()))?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read answers file from {:?}", path.as_ref()))?;
        let file: Self = serde_json::from_str(&content).context("Failed to parse answers file JSON")?;
        Ok(file)
    }

    /// Shape checks only; plan rules are enforced when the decisions are replayed.
    pub fn validate(&self) -> Result<()> {
        let device = self.device.trim();
        if device.is_empty() {
            anyhow::bail!("Target device must be specified");
        }
        if !device.starts_with("/dev/") {
            anyhow::bail!("Target device must be a /dev path, got '{}'", device);
        }
        if self.users.is_empty() {
            anyhow::bail!("At least one user must be specified");
        }
        if let LayoutChoice::Custom { partitions } = &self.layout {
            if partitions.is_empty() {
                anyhow::bail!("A custom layout needs at least one partition");
            }
        }
        Ok(())
    }

    /// Decisions to apply while at `stage`, before advancing from it.
    pub fn decisions_for(&self, stage: Stage, defaults: &Defaults) -> Vec<Decision> {
        match stage {
            Stage::DiskSelection => {
                let mut decisions = vec![Decision::SelectDevice {
                    device: self.device.trim().to_string(),
                }];
                if let Some(choice) = self.bootloader {
                    decisions.push(Decision::SetBootloader {
                        target: choice.target,
                        confirmed: choice.confirmed,
                    });
                }
                decisions
            }
            Stage::PartitionPlanning => match &self.layout {
                LayoutChoice::Default { swap_gib } => vec![Decision::UseDefaultLayout {
                    swap_gib: swap_gib.or(defaults.swap_gib),
                }],
                LayoutChoice::Custom { partitions } => partitions
                    .iter()
                    .map(|spec| Decision::AddPartition { spec: spec.clone() })
                    .collect(),
            },
            Stage::Identity => vec![Decision::SetIdentity {
                identity: self.identity(defaults),
            }],
            Stage::UserSetup => {
                let mut decisions: Vec<Decision> = self
                    .users
                    .iter()
                    .map(|user| Decision::AddUser { user: user.clone() })
                    .collect();
                if let Some(hash) = &self.root_password_hash {
                    decisions.push(Decision::SetRootPassword {
                        hash: Some(hash.clone()),
                    });
                }
                if self.waive_admin_requirement {
                    decisions.push(Decision::WaiveAdminRequirement { waived: true });
                }
                decisions
            }
            _ => Vec::new(),
        }
    }

    /// Host identity with missing fields taken from `defaults`.
    pub fn identity(&self, defaults: &Defaults) -> SystemIdentity {
        SystemIdentity {
            hostname: self.hostname.clone().unwrap_or_else(|| defaults.hostname.clone()),
            locale: self.locale.clone().unwrap_or_else(|| defaults.locale.clone()),
            timezone: self.timezone.clone().unwrap_or_else(|| defaults.timezone.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AuthMethod, PartitionSize};
    use crate::types::{Filesystem, PartitionRole};
    use tempfile::TempDir;

    fn create_test_file() -> PlanFile {
        PlanFile {
            device: "/dev/sda".to_string(),
            layout: LayoutChoice::default(),
            bootloader: None,
            hostname: Some("nixbox".to_string()),
            locale: None,
            timezone: None,
            users: vec![UserSpec {
                name: "alice".to_string(),
                is_admin: true,
                auth_method: AuthMethod::SetAfterInstall,
            }],
            root_password_hash: Some("$6$salt$hash".to_string()),
            waive_admin_requirement: false,
        }
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "device": "/dev/sda",
            "users": [{"name": "alice", "is_admin": true, "auth_method": {"kind": "set_after_install"}}]
        }"#;
        let file: PlanFile = serde_json::from_str(json).expect("minimal file parses"); // test: valid json
        assert_eq!(file.layout, LayoutChoice::Default { swap_gib: None });
        assert!(file.validate().is_ok());

        let identity = file.identity(&Defaults::default());
        assert_eq!(identity.hostname, "nixos");
        assert_eq!(identity.timezone, "UTC");
    }

    #[test]
    fn test_custom_layout_json() {
        let json = r#"{
            "device": "/dev/vda",
            "layout": {"kind": "custom", "partitions": [
                {"role": "boot", "size": {"exact": 536870912}, "filesystem": "fat32"},
                {"role": "root", "size": "remaining", "filesystem": "btrfs"}
            ]},
            "users": [{"name": "bob", "is_admin": true, "auth_method": {"kind": "hashed_password", "hash": "$6$x$y"}}]
        }"#;
        let file: PlanFile = serde_json::from_str(json).expect("custom file parses"); // test: valid json
        let decisions = file.decisions_for(Stage::PartitionPlanning, &Defaults::default());
        assert_eq!(
            decisions,
            vec![
                Decision::AddPartition {
                    spec: PartitionSpec::new(PartitionRole::Boot, PartitionSize::mib(512), Filesystem::Fat32)
                },
                Decision::AddPartition {
                    spec: PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, Filesystem::Btrfs)
                },
            ]
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{"device": "/dev/sda", "users": [], "hostnme": "typo"}"#;
        assert!(serde_json::from_str::<PlanFile>(json).is_err());
    }

    #[test]
    fn test_validation() {
        let mut file = create_test_file();
        file.device = "sda".to_string();
        assert!(file.validate().is_err());

        let mut file = create_test_file();
        file.users.clear();
        assert!(file.validate().is_err());

        let mut file = create_test_file();
        file.layout = LayoutChoice::Custom { partitions: Vec::new() };
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_decisions_per_stage() {
        let mut file = create_test_file();
        file.bootloader = Some(BootloaderChoice {
            target: BootloaderTarget::Bios,
            confirmed: true,
        });
        file.waive_admin_requirement = true;
        let defaults = Defaults {
            swap_gib: Some(2),
            ..Defaults::default()
        };

        assert!(file.decisions_for(Stage::Welcome, &defaults).is_empty());
        assert_eq!(file.decisions_for(Stage::DiskSelection, &defaults).len(), 2);
        assert_eq!(
            file.decisions_for(Stage::PartitionPlanning, &defaults),
            vec![Decision::UseDefaultLayout { swap_gib: Some(2) }]
        );
        let user_setup = file.decisions_for(Stage::UserSetup, &defaults);
        assert_eq!(user_setup.len(), 3);
        assert_eq!(
            user_setup[1],
            Decision::SetRootPassword {
                hash: Some("$6$salt$hash".to_string())
            }
        );
        assert_eq!(user_setup[2], Decision::WaiveAdminRequirement { waived: true });
        assert!(file.decisions_for(Stage::Review, &defaults).is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("answers.json");
        let file = create_test_file();
        file.save_to_file(&path).expect("save"); // test: writable tempdir
        let loaded = PlanFile::load_from_file(&path).expect("load"); // test: just written
        assert_eq!(loaded, file);
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(PlanFile::load_from_file("/nonexistent/answers.json").is_err());
    }
}
