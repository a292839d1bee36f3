//! Session journal
//!
//! A JSON Lines file written next to every installation so an interrupted
//! session can be diagnosed after a crash or power loss. One record per line:
//!
//! ```text
//! {"recorded_at":1760000000,"kind":"plan","plan":{...},"steps":["partition",...]}
//! {"recorded_at":1760000001,"kind":"transition","index":0,"label":"partition","from":"pending","to":"running",...}
//! {"recorded_at":1760000001,"kind":"log","index":0,"line":"$ wipefs --all /dev/sda"}
//! {"recorded_at":1760000420,"kind":"finished","status":"completed",...}
//! ```
//!
//! Records are append-only, flushed and synced to disk as soon as they are written.

use crate::engine::actions::{StepStatus, StepTransition};
use crate::engine::executor::{ExecutionOutcome, ManualInterventionRequired};
use crate::plan::PlanSnapshot;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Plan { plan: PlanSnapshot, steps: Vec<String> },
    Transition(StepTransition),
    Log { index: usize, line: String },
    ManualIntervention(ManualInterventionRequired),
    Finished(ExecutionOutcome),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Unix timestamp (seconds)
    pub recorded_at: u64,
    #[serde(flatten)]
    pub entry: JournalEntry,
}

/// Append-only writer for one session.
#[derive(Debug)]
pub struct SessionJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SessionJournal {
    /// Create `nixtui-session-<unix>.jsonl` inside `dir`.
    pub fn create(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("nixtui-session-{}.jsonl", crate::hardware::unix_now()));
        Self::create_at(&path)
    }

    /// Open `path` for appending, creating it if needed.
    pub fn create_at(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(path = %path.display(), "session journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: JournalEntry) -> io::Result<()> {
        let record = JournalRecord {
            recorded_at: crate::hardware::unix_now(),
            entry,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

/// Read every record of a journal. A truncated final line (crash mid-write) is skipped.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open session journal: {}", path.display()))?;
    // A crash can cut a record inside a multi-byte character; decode lossily
    let lines: Vec<String> = BufReader::new(file)
        .split(b'\n')
        .map(|raw| raw.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
        .collect::<io::Result<_>>()
        .with_context(|| format!("Failed to read session journal: {}", path.display()))?;

    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if n == last => {
                tracing::warn!(line = n + 1, error = %e, "ignoring truncated final journal record");
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Invalid journal record at {}:{}", path.display(), n + 1)
                });
            }
        }
    }
    Ok(records)
}

/// Post-mortem view of a journal.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalSummary {
    pub device: Option<String>,
    pub hostname: Option<String>,
    /// Step labels with their last recorded status
    pub steps: Vec<(String, StepStatus)>,
    pub manual: Vec<ManualInterventionRequired>,
    /// `None` when the session never finished
    pub outcome: Option<ExecutionOutcome>,
    pub started_at: Option<u64>,
    pub last_record_at: Option<u64>,
}

impl JournalSummary {
    pub fn from_records(records: &[JournalRecord]) -> Self {
        let mut summary = Self {
            device: None,
            hostname: None,
            steps: Vec::new(),
            manual: Vec::new(),
            outcome: None,
            started_at: None,
            last_record_at: records.last().map(|r| r.recorded_at),
        };
        let mut latest: BTreeMap<usize, StepStatus> = BTreeMap::new();

        for record in records {
            match &record.entry {
                JournalEntry::Plan { plan, steps } => {
                    summary.device = Some(plan.device_id.clone());
                    summary.hostname = Some(plan.identity.hostname.clone());
                    summary.started_at = Some(record.recorded_at);
                    summary.steps = steps
                        .iter()
                        .map(|label| (label.clone(), StepStatus::Pending))
                        .collect();
                }
                JournalEntry::Transition(t) => {
                    latest.insert(t.index, t.to);
                }
                JournalEntry::ManualIntervention(m) => summary.manual.push(m.clone()),
                JournalEntry::Finished(outcome) => summary.outcome = Some(outcome.clone()),
                JournalEntry::Log { .. } => {}
            }
        }
        for (index, status) in latest {
            if let Some(step) = summary.steps.get_mut(index) {
                step.1 = status;
            }
        }
        summary
    }

    /// Session stopped without a final record (crash, power loss, kill -9).
    pub fn is_interrupted(&self) -> bool {
        self.outcome.is_none()
    }

    /// Step that was running when the journal ends, if any.
    pub fn in_flight_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|(_, status)| *status == StepStatus::Running)
            .map(|(label, _)| label.as_str())
    }
}

impl fmt::Display for JournalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session: {} on {}",
            self.hostname.as_deref().unwrap_or("<unknown host>"),
            self.device.as_deref().unwrap_or("<unknown device>")
        )?;
        for (n, (label, status)) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>2}. {:<28} {}", n + 1, label, status)?;
        }
        for m in &self.manual {
            writeln!(f, "  ! {}", m)?;
        }
        match &self.outcome {
            Some(outcome) => write!(f, "Result: {}", outcome),
            None => match self.in_flight_step() {
                Some(step) => write!(f, "Result: interrupted while running '{}'", step),
                None => write!(f, "Result: interrupted"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::{ExecutionStatus, StepSummary};
    use tempfile::TempDir;

    fn transition(index: usize, label: &str, from: StepStatus, to: StepStatus) -> JournalEntry {
        JournalEntry::Transition(StepTransition {
            index,
            label: label.to_string(),
            from,
            to,
            at: 0,
        })
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let mut journal = SessionJournal::create(dir.path()).expect("create journal"); // test: writable tempdir
        journal
            .append(transition(0, "partition", StepStatus::Pending, StepStatus::Running))
            .expect("append"); // test: writable file
        journal
            .append(JournalEntry::Log {
                index: 0,
                line: "$ wipefs --all /dev/sda".to_string(),
            })
            .expect("append"); // test: writable file

        let records = read_journal(journal.path()).expect("read journal"); // test: just written
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1].entry, JournalEntry::Log { index: 0, .. }));
        assert!(
            journal
                .path()
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("nixtui-session-"))
        );
    }

    #[test]
    fn test_record_is_tagged_json_line() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("session.jsonl");
        let mut journal = SessionJournal::create_at(&path).expect("create"); // test: writable tempdir
        journal
            .append(JournalEntry::Log {
                index: 3,
                line: "building".to_string(),
            })
            .expect("append"); // test: writable file

        let raw = std::fs::read_to_string(&path).expect("read"); // test: just written
        let value: serde_json::Value = serde_json::from_str(raw.trim()).expect("json"); // test: one record
        assert_eq!(value["kind"], "log");
        assert_eq!(value["index"], 3);
        assert!(value["recorded_at"].is_u64());
    }

    #[test]
    fn test_truncated_last_line_is_skipped() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("session.jsonl");
        let mut journal = SessionJournal::create_at(&path).expect("create"); // test: writable tempdir
        journal
            .append(transition(0, "partition", StepStatus::Pending, StepStatus::Running))
            .expect("append"); // test: writable file
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).expect("open"); // test: file exists
        file.write_all(b"{\"recorded_at\":12,\"kind\":\"tran").expect("write"); // test: writable file

        let records = read_journal(&path).expect("read"); // test: partial tail tolerated
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_last_line_cut_inside_multibyte_char_is_skipped() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("session.jsonl");
        let mut journal = SessionJournal::create_at(&path).expect("create"); // test: writable tempdir
        journal
            .append(JournalEntry::Log {
                index: 5,
                line: "copying path '/nix/store/…-glibc'".to_string(),
            })
            .expect("append"); // test: writable file
        drop(journal);

        // "é" is 0xC3 0xA9; the crash hit between the two bytes
        let mut file = OpenOptions::new().append(true).open(&path).expect("open"); // test: file exists
        file.write_all(b"{\"recorded_at\":13,\"kind\":\"log\",\"index\":5,\"line\":\"caf\xC3")
            .expect("write"); // test: writable file

        let records = read_journal(&path).expect("read"); // test: partial tail tolerated
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].entry,
            JournalEntry::Log {
                index: 5,
                line: "copying path '/nix/store/…-glibc'".to_string(),
            }
        );
    }

    #[test]
    fn test_records_reach_the_file_before_the_journal_closes() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("session.jsonl");
        let mut journal = SessionJournal::create_at(&path).expect("create"); // test: writable tempdir
        for index in 0..3 {
            journal
                .append(transition(index, "format(root)", StepStatus::Pending, StepStatus::Running))
                .expect("append"); // test: writable file

            // Still open: a crash right now must leave every record readable
            let records = read_journal(&path).expect("read"); // test: just written
            assert_eq!(records.len(), index + 1);
        }
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = TempDir::new().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("session.jsonl");
        std::fs::write(&path, "not json\n{\"recorded_at\":1,\"kind\":\"log\",\"index\":0,\"line\":\"x\"}\n")
            .expect("write"); // test: writable tempdir
        assert!(read_journal(&path).is_err());
    }

    #[test]
    fn test_summary_of_interrupted_session() {
        let records = vec![
            JournalRecord {
                recorded_at: 10,
                entry: transition(0, "partition", StepStatus::Pending, StepStatus::Running),
            },
            JournalRecord {
                recorded_at: 11,
                entry: transition(0, "partition", StepStatus::Running, StepStatus::Succeeded),
            },
        ];
        let summary = JournalSummary::from_records(&records);
        // No plan record: step labels are unknown, so nothing is in flight
        assert!(summary.is_interrupted());
        assert_eq!(summary.last_record_at, Some(11));
        assert!(summary.to_string().ends_with("Result: interrupted"));
    }

    #[test]
    fn test_summary_of_finished_session() {
        let outcome = ExecutionOutcome {
            status: ExecutionStatus::Completed,
            failed_step: None,
            rollback: None,
            steps: vec![StepSummary {
                index: 0,
                label: "partition".to_string(),
                status: StepStatus::Succeeded,
            }],
        };
        let records = vec![JournalRecord {
            recorded_at: 20,
            entry: JournalEntry::Finished(outcome.clone()),
        }];
        let summary = JournalSummary::from_records(&records);
        assert!(!summary.is_interrupted());
        assert_eq!(summary.outcome, Some(outcome));
        assert!(summary.to_string().ends_with("Result: installation completed"));
    }
}
