//! Installer settings
//!
//! Loaded from a TOML file (`/etc/nixtui/config.toml` unless `--config` names
//! another). Every key is optional; a missing default file means defaults.
//!
//! ```toml
//! target_root = "/mnt"
//! journal_dir = "/tmp"
//! state_version = "24.11"
//!
//! [limits]
//! min_boot_mib = 256
//! min_root_mib = 4096
//! allow_admin_waiver = false
//!
//! [defaults]
//! hostname = "nixos"
//! locale = "en_US.UTF-8"
//! timezone = "UTC"
//!
//! [hooks]
//! pre_install = []
//! post_install = ["/etc/nixtui/hooks/copy-dotfiles.sh"]
//! ```

use crate::engine::EngineSettings;
use crate::types::MIB;
use crate::validator::ValidationPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nixtui/config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse settings in {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Refusing to overwrite existing file {path} (use --force)")]
    AlreadyExists { path: PathBuf },

    #[error("Failed to write settings to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Partition minimums and the admin rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub min_boot_mib: u64,
    pub min_root_mib: u64,
    pub allow_admin_waiver: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_boot_mib: 256,
            min_root_mib: 4096,
            allow_admin_waiver: false,
        }
    }
}

/// Values used when an answers file leaves a field out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    pub hostname: String,
    pub username: Option<String>,
    pub locale: String,
    pub timezone: String,
    pub swap_gib: Option<u64>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            hostname: "nixos".to_string(),
            username: None,
            locale: "en_US.UTF-8".to_string(),
            timezone: "UTC".to_string(),
            swap_gib: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hooks {
    pub pre_install: Vec<PathBuf>,
    pub post_install: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerSettings {
    pub target_root: PathBuf,
    /// Where session journals are written
    pub journal_dir: PathBuf,
    pub state_version: String,
    pub no_channel_copy: bool,
    pub limits: Limits,
    pub defaults: Defaults,
    pub hooks: Hooks,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/mnt"),
            journal_dir: PathBuf::from("/tmp"),
            state_version: "24.11".to_string(),
            no_channel_copy: false,
            limits: Limits::default(),
            defaults: Defaults::default(),
            hooks: Hooks::default(),
        }
    }
}

impl InstallerSettings {
    /// Load settings from `path`, or from [`DEFAULT_CONFIG_PATH`] when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if !explicit && e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::ReadFailed { path, source }),
        };

        let settings: Self =
            toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
                path: path.clone(),
                source,
            })?;
        settings.validate()?;
        tracing::info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_root.is_absolute() {
            return Err(ConfigError::Invalid {
                key: "target_root",
                reason: format!("{} is not an absolute path", self.target_root.display()),
            });
        }
        if self.state_version.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "state_version",
                reason: "must not be empty".to_string(),
            });
        }
        if self.limits.min_boot_mib == 0 {
            return Err(ConfigError::Invalid {
                key: "limits.min_boot_mib",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.limits.min_root_mib == 0 {
            return Err(ConfigError::Invalid {
                key: "limits.min_root_mib",
                reason: "must be greater than zero".to_string(),
            });
        }
        for (key, mib) in [
            ("limits.min_boot_mib", self.limits.min_boot_mib),
            ("limits.min_root_mib", self.limits.min_root_mib),
        ] {
            if mib.checked_mul(MIB).is_none() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{} MiB is larger than any device", mib),
                });
            }
        }
        for (key, hooks) in [
            ("hooks.pre_install", &self.hooks.pre_install),
            ("hooks.post_install", &self.hooks.post_install),
        ] {
            if let Some(relative) = hooks.iter().find(|h| !h.is_absolute()) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{} is not an absolute path", relative.display()),
                });
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            min_boot_bytes: self.limits.min_boot_mib.saturating_mul(MIB),
            min_root_bytes: self.limits.min_root_mib.saturating_mul(MIB),
            allow_admin_waiver: self.limits.allow_admin_waiver,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            target_root: self.target_root.clone(),
            state_version: self.state_version.clone(),
            pre_install_hooks: self.hooks.pre_install.clone(),
            post_install_hooks: self.hooks.post_install.clone(),
            no_channel_copy: self.no_channel_copy,
        }
    }
}

/// Commented settings file written by `nixtui init-config`.
pub fn default_config_toml() -> &'static str {
    r#"# nixtui installer settings

# Where the target system is mounted during installation
target_root = "/mnt"

# Directory receiving nixtui-session-<timestamp>.jsonl journals
journal_dir = "/tmp"

# system.stateVersion of the installed system
state_version = "24.11"

# Skip copying the installer's channel into the target
no_channel_copy = false

[limits]
# Minimum EFI System Partition size (UEFI only)
min_boot_mib = 256
min_root_mib = 4096
# Allow answers files to lift the exactly-one-administrator rule
allow_admin_waiver = false

[defaults]
hostname = "nixos"
locale = "en_US.UTF-8"
timezone = "UTC"
# swap_gib = 4

[hooks]
# Absolute paths of shell scripts; they receive INSTALLER_HOST_NAME,
# INSTALLER_DISK, INSTALLER_MOUNT_ROOT and INSTALLER_CONFIG_DIR
pre_install = []
post_install = []
"#
}

/// Write [`default_config_toml`] to `path`.
pub fn write_default(path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, default_config_toml()).map_err(|source| ConfigError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}
