//! Process lifecycle management for external tools
//!
//! Ensures that tools spawned during an installation (sgdisk, mkfs, nixos-install)
//! never outlive the installer.
//!
//! # Problem Solved
//! Without explicit process group management, if the installer crashes while a
//! destructive tool (e.g. `sgdisk --zap-all`) is running, the child becomes
//! orphaned and keeps writing to the disk.
//!
//! # Solution
//! - Spawn children in their own process group with a parent-death signal
//! - Track all child PIDs in a global registry
//! - On the first SIGINT/SIGTERM/SIGHUP, request cancellation so the engine stops at
//!   the next step boundary and rolls back
//! - On a repeated signal or on drop, SIGTERM every child group, SIGKILL after a grace period

use crate::engine::CancelToken;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Lock a registry, recovering from a poisoned mutex.
    ///
    /// The registry is a plain PID set, so a panic while it was held cannot leave
    /// it logically inconsistent.
    pub fn lock(registry: &Mutex<ChildRegistry>) -> MutexGuard<'_, ChildRegistry> {
        registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process");
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("no child processes to terminate");
            return;
        }

        info!(count = self.pids.len(), "terminating child processes");

        // Group signals reach the whole tree (nixos-install spawns nix, nix spawns builders)
        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM to process group");
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!(pid, error = %e2, "failed to send SIGTERM to process");
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids_to_kill.iter().any(|&pid| is_process_alive(pid)) {
                info!("all child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!(pid, "process group did not terminate, sending SIGKILL");
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    error!(pid, error = %e, "failed to send SIGKILL to process group");
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        info!("child process cleanup complete");
    }
}

/// SIGKILL a tool's whole process group at once, falling back to the leader alone.
pub fn kill_process_group(pgid: u32) {
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGKILL) {
        debug!(pid = pgid, error = %e, "group SIGKILL failed, signalling leader");
        let _ = send_signal(pgid, Signal::SIGKILL);
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals every process in the group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all children on drop.
/// Held by the binary for the lifetime of an installation.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        ChildRegistry::lock(&self.registry).count()
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        ChildRegistry::lock(&self.registry).terminate_all(Duration::from_secs(5));
    }
}

/// Install SIGINT, SIGTERM and SIGHUP handling for an installation session.
///
/// The first signal requests cancellation through `cancel`; the engine finishes the
/// running step and rolls back. A second signal terminates all children and exits
/// with `128 + signal`.
pub fn init_signal_handlers(cancel: CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let signal_name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };

                if !cancel.is_cancelled() {
                    warn!(
                        signal = signal_name,
                        "cancellation requested; finishing the current step, repeat to force exit"
                    );
                    cancel.cancel();
                    continue;
                }

                error!(signal = signal_name, "forced exit requested, killing child processes");
                ChildRegistry::lock(&ChildRegistry::global()).terminate_all(Duration::from_secs(3));
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// This allows us to kill the entire process tree with a single signal
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with the installer instead of continuing a destructive write
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
