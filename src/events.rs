//! Progress/event bus between the execution engine and its observers.
//!
//! Single producer, single consumer, in-order delivery. The engine owns the
//! only [`EventSender`]; a UI or the headless installer owns the
//! [`EventReceiver`]. A consumer that goes away never stalls the engine:
//! sends to a disconnected receiver are dropped after one warning.

use crate::engine::{ExecutionOutcome, ManualInterventionRequired, StepTransition};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Everything an observer learns about a running installation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Emitted once before the first step runs
    Started { total_steps: usize, labels: Vec<String> },
    Transition(StepTransition),
    /// One output line of the step at `index`
    Log { index: usize, line: String },
    /// Cancellation was observed before step `at_step` started
    CancellationRequested { at_step: usize },
    ManualInterventionRequired(ManualInterventionRequired),
    /// Always the last event of a run
    Finished(ExecutionOutcome),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Producer half. Deliberately not `Clone`: there is exactly one producer.
#[derive(Debug)]
pub struct EventSender {
    tx: Sender<ProgressEvent>,
    disconnected: bool,
}

impl EventSender {
    pub fn send(&mut self, event: ProgressEvent) {
        if self.disconnected {
            return;
        }
        if self.tx.send(event).is_err() {
            self.disconnected = true;
            tracing::warn!("progress receiver dropped; further events are discarded");
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<ProgressEvent>,
}

impl EventReceiver {
    /// Block until the next event; `None` once the engine is gone.
    pub fn recv(&self) -> Option<ProgressEvent> {
        self.rx.recv().ok()
    }

    /// Non-blocking poll for UI tick loops.
    pub fn try_recv(&self) -> Result<Option<ProgressEvent>, TryRecvError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<ProgressEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Drain events until the engine drops its sender.
    pub fn iter(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        self.rx.iter()
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel();
    (
        EventSender {
            tx,
            disconnected: false,
        },
        EventReceiver { rx },
    )
}
