//! Error Types
//!
//! Three layers:
//!
//! - [`FatalError`]: the terminal taxonomy. Any of these halts the
//!   instance for good.
//! - [`EngineError`]: what the public surface returns.
//! - [`ComputeError`]: what a producer returns. Producers propagate
//!   [`ComputeError::Interrupted`] from accessor reads with `?`.

use serde::Serialize;
use thiserror::Error;

/// Writer name used when a derived node is written from outside the graph.
pub const EXTERNAL_WRITER: &str = "<external>";

/// Terminal evaluation errors.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind")]
pub enum FatalError {
    /// A name was reached while already on the active evaluation stack.
    #[error("circular dependency: {}", stack.join(" -> "))]
    CircularDependency { stack: Vec<String> },

    /// A producer wrote a name other than its own, or a derived name was
    /// written externally.
    #[error("illegal write to `{target}` by `{writer}`")]
    IllegalWrite { writer: String, target: String },

    /// A producer read a name that is not in the graph.
    #[error("`{node}` read unknown name `{name}`")]
    UnknownDependency { node: String, name: String },

    /// A producer failed. `inputs` holds the values it had read.
    #[error("producer `{node}` failed: {message}")]
    ComputeException {
        node: String,
        message: String,
        inputs: Vec<(String, serde_json::Value)>,
    },
}

/// The recorded fatal state of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FatalRecord {
    pub error: FatalError,
    pub message: String,
    /// Active evaluation stack when the fault was raised, outermost first.
    pub stack: Vec<String>,
}

impl FatalRecord {
    pub fn new(error: FatalError, stack: Vec<String>) -> Self {
        Self {
            message: error.to_string(),
            error,
            stack,
        }
    }
}

/// Errors returned by [`crate::Engine`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// This call drove the engine into Fatal State.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// The engine was already in Fatal State; the call was a no-op.
    #[error("engine is halted by an earlier fatal error")]
    Halted,

    #[error("unknown name `{0}`")]
    UnknownName(String),

    #[error("`{0}` is already declared")]
    DuplicateName(String),

    /// `name` was read, written or subscribed while a producer was running.
    /// A write also halts the engine with an illegal write.
    #[error("`{0}` was accessed while a producer was running")]
    Reentrant(String),

    /// An engine-wide operation was called while a producer was running.
    #[error("engine is busy running a producer")]
    Busy,
}

/// Errors a producer can return.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    /// The producer itself failed.
    #[error("{0}")]
    Failed(String),

    /// Evaluation was blocked on a pending value or halted.
    #[error("evaluation interrupted")]
    Interrupted,
}

impl From<&str> for ComputeError {
    fn from(message: &str) -> Self {
        ComputeError::Failed(message.to_string())
    }
}

impl From<String> for ComputeError {
    fn from(message: String) -> Self {
        ComputeError::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_the_stack() {
        let err = FatalError::CircularDependency {
            stack: vec!["tick".into(), "tock".into(), "tick".into()],
        };
        assert_eq!(err.to_string(), "circular dependency: tick -> tock -> tick");
    }

    #[test]
    fn record_captures_display_message() {
        let record = FatalRecord::new(
            FatalError::UnknownDependency {
                node: "total".into(),
                name: "missing".into(),
            },
            vec!["total".into()],
        );
        assert_eq!(record.message, "`total` read unknown name `missing`");
    }

    #[test]
    fn fatal_errors_serialize_with_kind_tag() {
        let err = FatalError::IllegalWrite {
            writer: EXTERNAL_WRITER.into(),
            target: "sum".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "IllegalWrite");
        assert_eq!(json["target"], "sum");
    }
}
