//! Error handling module for nixtui
//!
//! Each subsystem raises its own error type next to the code that produces it.
//! [`NixTuiError`] gathers them for callers that drive several subsystems at
//! once, such as the headless installer.

use crate::config::ConfigError;
use crate::hardware::ProbeError;
use crate::install_state::{DecisionError, InvalidTransitionError};
use crate::plan::{FreezeError, PlanConstraintViolation};
use thiserror::Error;

/// Main error type for nixtui
#[derive(Error, Debug)]
pub enum NixTuiError {
    /// IO errors (journal, configuration files, mount points)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Settings(#[from] ConfigError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Constraint(#[from] PlanConstraintViolation),

    #[error(transparent)]
    Freeze(#[from] FreezeError),

    #[error(transparent)]
    Transition(#[from] InvalidTransitionError),

    /// Configuration errors that are not tied to a settings key
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (answers files, user input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// System errors (pre-flight checks, processes)
    #[error("System error: {0}")]
    System(String),

    /// A stage validator refused to advance
    #[error("Cannot leave stage {stage}: {reasons}")]
    Blocked { stage: String, reasons: String },
}

impl From<DecisionError> for NixTuiError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::Transition(e) => Self::Transition(e),
            DecisionError::Constraint(e) => Self::Constraint(e),
        }
    }
}

/// Result type alias for nixtui operations
pub type Result<T> = std::result::Result<T, NixTuiError>;

// Convenient error constructors
impl NixTuiError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    pub fn blocked(stage: impl ToString, reasons: &[impl ToString]) -> Self {
        Self::Blocked {
            stage: stage.to_string(),
            reasons: reasons
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install_state::Stage;

    #[test]
    fn test_error_display() {
        let err = NixTuiError::config("journal_dir is not writable");
        assert_eq!(err.to_string(), "Configuration error: journal_dir is not writable");

        let err = NixTuiError::validation("device must be a /dev path");
        assert_eq!(err.to_string(), "Validation error: device must be a /dev path");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NixTuiError = io_err.into();
        assert!(matches!(err, NixTuiError::Io(_)));
    }

    #[test]
    fn test_decision_error_flattens() {
        let err: NixTuiError = DecisionError::Constraint(PlanConstraintViolation::NoTargetDevice).into();
        assert!(matches!(err, NixTuiError::Constraint(_)));

        let err: NixTuiError = DecisionError::Transition(InvalidTransitionError::DuringExecution {
            operation: "advance",
        })
        .into();
        assert!(matches!(err, NixTuiError::Transition(_)));
    }

    #[test]
    fn test_blocked_joins_reasons() {
        let err = NixTuiError::blocked(Stage::DiskSelection, &["first", "second"]);
        assert!(err.to_string().ends_with(": first; second"));
    }
}
