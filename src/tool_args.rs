//! Type-safe argument contracts for external tools.
//!
//! Every executable the installer invokes (sgdisk, mkfs.*, mount, nixos-install, ...)
//! is described by a Rust struct implementing [`ToolArgs`]. The struct definition is
//! the contract: flag spellings live in exactly one place and are covered by unit
//! tests, instead of being scattered across ad-hoc `Vec<String>` builders.
//!
//! # Contract
//!
//! - `program()`: the executable name, resolved through `PATH` at execution time.
//! - `to_cli_args()`: arguments exactly as the tool expects them.
//! - `get_env_vars()`: extra environment the tool requires (empty by default).

use crate::command_runner::CommandSpec;

/// Trait for typed external-tool arguments.
///
/// # Example
///
/// ```
/// use nixtui::tool_args::ToolArgs;
/// use nixtui::tools::disk::WipeSignaturesArgs;
/// use std::path::PathBuf;
///
/// let args = WipeSignaturesArgs { device: PathBuf::from("/dev/sda") };
/// assert_eq!(args.program(), "wipefs");
/// assert_eq!(args.to_cli_args(), vec!["--all", "/dev/sda"]);
/// ```
pub trait ToolArgs {
    /// Executable name (e.g. `"sgdisk"`).
    fn program(&self) -> &'static str;

    /// Convert struct fields to CLI arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Environment variables the tool requires.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Bundle program, arguments and environment for a [`CommandRunner`](crate::command_runner::CommandRunner).
    fn to_command(&self) -> CommandSpec {
        CommandSpec {
            program: self.program().to_string(),
            args: self.to_cli_args(),
            env: self.get_env_vars(),
        }
    }
}
