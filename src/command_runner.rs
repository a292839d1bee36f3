//! Command execution
//!
//! This module provides the ONLY sanctioned way to run external tools during an
//! installation. The execution engine talks to a [`CommandRunner`]; production
//! uses [`SystemRunner`], `--dry-run` uses [`DryRunRunner`], and tests script
//! their own runner.
//!
//! # Architecture Rule
//!
//! [`SystemRunner`] spawns every tool in its own process group and registers it
//! with [`ChildRegistry`], so a crashing or interrupted installer never leaves a
//! half-finished `mkfs` or `nixos-install` running behind it.

use crate::process_guard::{ChildRegistry, CommandProcessGroup, kill_process_group};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

/// Lines of tool output kept as the diagnostic of a failed step.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, value)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl ToolOutput {
    /// Successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// Last lines of stderr (or stdout when stderr is empty), verbatim.
    pub fn diagnostic(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
        lines[start..].join("\n")
    }

    /// Human-readable exit description ("exit code 1", "killed by signal").
    pub fn exit_description(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "killed by signal".to_string(),
        }
    }
}

/// Runs external commands, streaming each output line to `on_line` as it arrives.
pub trait CommandRunner: Send {
    fn run(&mut self, cmd: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput>;

    /// Whether commands only pretend to run (filesystem writes are skipped too).
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runner backed by real processes.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Decode one raw output line, dropping the line terminator.
///
/// Tools are not bound to UTF-8; invalid bytes become U+FFFD instead of ending the read.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{:?}-reader", stream).to_lowercase())
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send((stream, decode_line(&raw))).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(?stream, error = %e, "stopped reading tool output");
                        break;
                    }
                }
            }
        })
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, cmd: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput> {
        info!(command = %cmd, "running tool");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        ChildRegistry::lock(&ChildRegistry::global()).register(pid);

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        let streams = [
            child.stdout.take().map(|r| spawn_reader(r, Stream::Stdout, tx.clone())),
            child.stderr.take().map(|r| spawn_reader(r, Stream::Stderr, tx.clone())),
        ];
        drop(tx);
        for spawned in streams.into_iter().flatten() {
            match spawned {
                Ok(handle) => readers.push(handle),
                Err(e) => {
                    warn!(program = %cmd.program, error = %e, "could not start output reader, killing tool");
                    kill_process_group(pid);
                    let _ = child.wait();
                    ChildRegistry::lock(&ChildRegistry::global()).unregister(pid);
                    for reader in readers {
                        let _ = reader.join();
                    }
                    return Err(e);
                }
            }
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        for (stream, line) in rx {
            on_line(&line);
            let buf = match stream {
                Stream::Stdout => &mut stdout,
                Stream::Stderr => &mut stderr,
            };
            buf.push_str(&line);
            buf.push('\n');
        }
        for reader in readers {
            if reader.join().is_err() {
                warn!(program = %cmd.program, "output reader thread panicked");
            }
        }

        let status = child.wait();
        ChildRegistry::lock(&ChildRegistry::global()).unregister(pid);
        let status = status?;

        let exit_code = status.code();
        if status.success() {
            debug!(program = %cmd.program, "tool succeeded");
        } else {
            warn!(program = %cmd.program, code = ?exit_code, "tool failed");
        }

        Ok(ToolOutput {
            stdout,
            stderr,
            exit_code,
            success: status.success(),
        })
    }
}

/// Runner that logs commands instead of executing them.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    executed: Vec<CommandSpec>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands "run" so far, in order.
    pub fn executed(&self) -> &[CommandSpec] {
        &self.executed
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&mut self, cmd: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput> {
        info!(command = %cmd, "[dry-run] would run");
        on_line(&format!("[dry-run] {}", cmd));
        self.executed.push(cmd.clone());
        Ok(ToolOutput::ok(""))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
