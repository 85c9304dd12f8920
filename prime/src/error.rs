//! Error taxonomy surfaced at the engine boundary.
//!
//! Internal plumbing uses `anyhow`; callers that need to branch on the kind
//! of failure (the HTTP layer mapping `TaskNotFound` to 404, for example) get
//! an [`EngineError`].

use thiserror::Error;

use crate::core::types::TaskId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("no recognizable directive in model reply")]
    DirectiveUnparseable,

    #[error("unsafe directive rejected: {0}")]
    UnsafeDirective(String),

    #[error("execution timed out after {0} seconds")]
    ExecutionTimeout(u64),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("self-update rejected: {0}")]
    SelfUpdateRejected(String),

    #[error("self-update failed: {0}")]
    SelfUpdateFailed(String),

    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Wrap a plumbing error, keeping its context chain in the message.
    pub fn store(err: anyhow::Error) -> Self {
        EngineError::Store(format!("{err:#}"))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
