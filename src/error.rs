//! Error type for the evaluation core.
//!
//! Collaborators (model runtime, feeders, evaluation stores) speak
//! `anyhow::Result`; the core wraps their failures here without touching the
//! source chain.

use thiserror::Error;

/// Root error type for evaluation and recording failures.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Inputs or targets could not be shaped into a `[batch, length]` token matrix.
    #[error("unable to convert {what} of type {type_name} into a token matrix")]
    Conversion {
        what: &'static str,
        type_name: String,
    },

    /// A caller broke a usage contract (programming error, not retried).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The compute runtime failed while executing a step.
    #[error("model runtime failed")]
    Model(#[source] anyhow::Error),

    /// The evaluation store failed to create a document or append records.
    #[error("evaluation store failed")]
    Store(#[source] anyhow::Error),

    /// A feeder could not produce the next block.
    #[error("feeder failed")]
    Feeder(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] bincode::Error),
}

impl EvalError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn conversion(what: &'static str, type_name: impl Into<String>) -> Self {
        Self::Conversion {
            what,
            type_name: type_name.into(),
        }
    }
}

pub type EvalResult<T> = Result<T, EvalError>;
