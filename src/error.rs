//! Error Types
//!
//! Definition errors are raised synchronously while a sequence is loaded and
//! validated; execution never starts for a sequence that produced one.
//! Engine errors report misuse of the run control surface.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, validating or preparing a sequence.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// Malformed block or sequence definition (ids, properties, links).
    #[error("Sequence syntax error: {0}")]
    Syntax(String),

    /// Structurally invalid graph (entry/exit, reciprocity, cycles, orphans).
    #[error("Invalid sequence: {0}")]
    Structural(String),

    /// An action block could not be bound to its plugin or parameters.
    #[error("Action creation error: {0}")]
    ActionCreation(String),

    /// The sequence file could not be read.
    #[error("Failed to read sequence file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sequence file is not a valid YAML sequence document.
    #[error("Failed to parse sequence YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SequenceError {
    pub(crate) fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    pub(crate) fn action(msg: impl Into<String>) -> Self {
        Self::ActionCreation(msg.into())
    }

    /// Returns true for errors of the syntax class.
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax(_))
    }

    /// Returns true for errors of the structural class.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}

/// Errors returned by the run control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No sequence is loaded")]
    NotLoaded,

    #[error("The sequence is already started")]
    AlreadyStarted,

    #[error("A sequence is running; interrupt it before loading another one")]
    Busy,

    #[error(transparent)]
    Load(#[from] SequenceError),

    #[error("Failed to start the run thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(SequenceError::syntax("x").is_syntax());
        assert!(!SequenceError::syntax("x").is_structural());
        assert!(SequenceError::structural("x").is_structural());
        assert!(!SequenceError::action("x").is_syntax());
    }

    #[test]
    fn test_error_display() {
        let err = SequenceError::structural("No Begin block");
        assert_eq!(err.to_string(), "Invalid sequence: No Begin block");

        let err = EngineError::from(SequenceError::syntax("bad id"));
        assert_eq!(err.to_string(), "Sequence syntax error: bad id");
    }
}
