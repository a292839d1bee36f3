// Shared fixtures for the nixtui integration tests
//
// Every test builds its own hardware snapshot and drives the real
// orchestrator and engine; only the external tools are scripted.

#![allow(dead_code)]

use nixtui::command_runner::{CommandRunner, CommandSpec, ToolOutput};
use nixtui::engine::{CancelToken, EngineSettings};
use nixtui::hardware::{BlockDevice, FirmwareMode, HardwareSnapshot};
use nixtui::install_state::{AdvanceOutcome, Decision, Orchestrator, Stage};
use nixtui::plan::{AuthMethod, SystemIdentity, UserSpec};
use nixtui::types::GIB;
use nixtui::validator::ValidationPolicy;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// =============================================================================
// Hardware and plan fixtures
// =============================================================================

pub fn disk(id: &str, size_bytes: u64) -> BlockDevice {
    BlockDevice {
        id: id.to_string(),
        size_bytes: Some(size_bytes),
        model: Some("QEMU HARDDISK".to_string()),
        existing_partitions: Vec::new(),
        removable: false,
        degraded: false,
        mount_point: None,
    }
}

pub fn snapshot_with(firmware: FirmwareMode, devices: Vec<BlockDevice>) -> Arc<HardwareSnapshot> {
    Arc::new(HardwareSnapshot::new(firmware, devices, Vec::new()))
}

/// A single 20 GiB `/dev/sda` on a UEFI machine.
pub fn uefi_snapshot_20g() -> Arc<HardwareSnapshot> {
    snapshot_with(FirmwareMode::Uefi, vec![disk("/dev/sda", 20 * GIB)])
}

pub fn identity() -> SystemIdentity {
    SystemIdentity {
        hostname: "nixos".to_string(),
        locale: "en_US.UTF-8".to_string(),
        timezone: "UTC".to_string(),
    }
}

pub fn admin(name: &str) -> UserSpec {
    UserSpec {
        name: name.to_string(),
        is_admin: true,
        auth_method: AuthMethod::HashedPassword {
            hash: "$6$rounds=5000$saltsalt$hashhash".to_string(),
        },
    }
}

/// Advance once, failing the test with the block reasons if refused.
pub fn advance_ok(orchestrator: &mut Orchestrator) -> Stage {
    match orchestrator.advance().expect("advance from a decision stage") {
        AdvanceOutcome::Advanced(stage) => stage,
        AdvanceOutcome::Blocked(reasons) => panic!(
            "advance from {} blocked: {:?}",
            orchestrator.stage(),
            reasons
        ),
    }
}

/// Walk a fresh session on `/dev/sda` with the default layout up to Review.
pub fn session_at_review(snapshot: Arc<HardwareSnapshot>) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(snapshot, ValidationPolicy::default());
    advance_ok(&mut orchestrator);

    orchestrator
        .apply(Decision::SelectDevice {
            device: "/dev/sda".to_string(),
        })
        .expect("select /dev/sda");
    advance_ok(&mut orchestrator);

    orchestrator
        .apply(Decision::UseDefaultLayout { swap_gib: None })
        .expect("default layout");
    advance_ok(&mut orchestrator);

    orchestrator
        .apply(Decision::SetIdentity {
            identity: identity(),
        })
        .expect("identity");
    advance_ok(&mut orchestrator);

    orchestrator
        .apply(Decision::AddUser { user: admin("alice") })
        .expect("admin user");
    assert_eq!(advance_ok(&mut orchestrator), Stage::Review);
    orchestrator
}

/// A session that has left Review and is waiting for the engine.
pub fn session_executing(snapshot: Arc<HardwareSnapshot>) -> Orchestrator {
    let mut orchestrator = session_at_review(snapshot);
    orchestrator
        .confirm_destructive_operations()
        .expect("confirm at Review");
    assert_eq!(advance_ok(&mut orchestrator), Stage::Executing);
    orchestrator
}

pub fn engine_settings(target_root: &Path) -> EngineSettings {
    EngineSettings {
        target_root: target_root.to_path_buf(),
        ..EngineSettings::default()
    }
}

// =============================================================================
// Scripted tool runner
// =============================================================================

/// Commands seen by a [`ScriptedRunner`], shared with the test after the
/// runner has been boxed into the engine.
pub type CallLog = Arc<Mutex<Vec<CommandSpec>>>;

struct FailRule {
    program: String,
    arg: Option<String>,
}

impl FailRule {
    fn matches(&self, cmd: &CommandSpec) -> bool {
        cmd.program == self.program
            && self
                .arg
                .as_ref()
                .map_or(true, |needle| cmd.args.iter().any(|a| a == needle))
    }
}

/// Stands in for the real tools.
///
/// Every command succeeds with one output line unless a fail rule matches.
/// `nixos-install` creates the system profile under `--root` the way the
/// real tool does, and `nixos-generate-config` prints a hardware module.
pub struct ScriptedRunner {
    calls: CallLog,
    failures: Vec<FailRule>,
    cancel_on: Option<(String, CancelToken)>,
}

impl ScriptedRunner {
    pub fn new() -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                calls: Arc::clone(&calls),
                failures: Vec::new(),
                cancel_on: None,
            },
            calls,
        )
    }

    /// Fail every invocation of `program`.
    pub fn fail(mut self, program: &str) -> Self {
        self.failures.push(FailRule {
            program: program.to_string(),
            arg: None,
        });
        self
    }

    /// Fail invocations of `program` that carry exactly `arg`.
    pub fn fail_with_arg(mut self, program: &str, arg: &str) -> Self {
        self.failures.push(FailRule {
            program: program.to_string(),
            arg: Some(arg.to_string()),
        });
        self
    }

    /// Trip `token` while the first `program` invocation is running.
    pub fn cancel_during(mut self, program: &str, token: CancelToken) -> Self {
        self.cancel_on = Some((program.to_string(), token));
        self
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&mut self, cmd: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput> {
        self.calls
            .lock()
            .expect("call log lock")
            .push(cmd.clone());

        if let Some((program, token)) = &self.cancel_on {
            if *program == cmd.program {
                token.cancel();
            }
        }

        if self.failures.iter().any(|rule| rule.matches(cmd)) {
            let stderr = format!("{}: Device or resource busy", cmd.program);
            on_line(&stderr);
            return Ok(ToolOutput::failed(1, stderr));
        }

        let stdout = match cmd.program.as_str() {
            "nixos-generate-config" => "{ config, lib, pkgs, ... }:\n{\n}\n".to_string(),
            "nixos-install" => {
                let root = arg_after(cmd, "--root").ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "nixos-install without --root")
                })?;
                let profile = root.join("nix/var/nix/profiles/system");
                std::fs::create_dir_all(&profile)?;
                "installation finished!".to_string()
            }
            program => format!("{}: ok", program),
        };
        for line in stdout.lines() {
            on_line(line);
        }
        Ok(ToolOutput::ok(stdout))
    }
}

fn arg_after(cmd: &CommandSpec, flag: &str) -> Option<PathBuf> {
    let pos = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(pos + 1).map(PathBuf::from)
}

/// Program names in call order.
pub fn programs(calls: &CallLog) -> Vec<String> {
    calls
        .lock()
        .expect("call log lock")
        .iter()
        .map(|c| c.program.clone())
        .collect()
}

/// Full command lines in call order.
pub fn command_lines(calls: &CallLog) -> Vec<String> {
    calls
        .lock()
        .expect("call log lock")
        .iter()
        .map(|c| c.to_string())
        .collect()
}
