use std::fmt;

use thiserror::Error;

use crate::types::AgentVariant;

/// Pipeline stage a window was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scheduling,
    Turbulence,
    Training,
    Validation,
    Selection,
    Trading,
    Persistence,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scheduling => "scheduling",
            Stage::Turbulence => "turbulence",
            Stage::Training => "training",
            Stage::Validation => "validation",
            Stage::Selection => "selection",
            Stage::Trading => "trading",
            Stage::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Training failed for {variant} in window {window}: {message}")]
    TrainingFailure {
        variant: AgentVariant,
        window: usize,
        message: String,
    },

    #[error("Environment step failed in window {window}: {message}")]
    EnvironmentStep { window: usize, message: String },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("State vector shape mismatch: expected {expected}, got {actual}")]
    StateShape { expected: usize, actual: usize },

    #[error("No candidate agents survived training in window {window}")]
    NoCandidates { window: usize },

    #[error("Run cancelled before window {window}")]
    Cancelled { window: usize },

    #[error("Window {window} failed during {stage}: {source}")]
    WindowFailed {
        window: usize,
        stage: Stage,
        #[source]
        source: Box<EnsembleError>,
    },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnsembleError {
    /// Attach the window index and stage to a fatal error. Errors that
    /// already carry that context pass through untouched.
    pub fn in_window(self, window: usize, stage: Stage) -> Self {
        match self {
            e @ EnsembleError::WindowFailed { .. } => e,
            e @ EnsembleError::Cancelled { .. } => e,
            other => EnsembleError::WindowFailed {
                window,
                stage,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EnsembleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_context_is_attached_once() {
        let err = EnsembleError::StateShape {
            expected: 3,
            actual: 2,
        }
        .in_window(126, Stage::Trading)
        .in_window(189, Stage::Validation);

        match &err {
            EnsembleError::WindowFailed { window, stage, .. } => {
                assert_eq!(*window, 126);
                assert_eq!(*stage, Stage::Trading);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("Window 126 failed during trading"));
    }

    #[test]
    fn test_cancellation_is_not_wrapped() {
        let err = EnsembleError::Cancelled { window: 63 }.in_window(63, Stage::Training);
        assert!(matches!(err, EnsembleError::Cancelled { window: 63 }));
    }
}
