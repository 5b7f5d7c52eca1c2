use ambar::ValidationError;
use std::sync::Arc;
use thiserror::Error;

/// Error type fallible actions may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why an action did not produce a new agent state.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The action returned an error.
    #[error("action failed: {0}")]
    Failed(#[source] BoxError),
    /// The action panicked.
    #[error("action panicked: {0}")]
    Panicked(String),
    /// A validator rejected the state the action produced.
    #[error("action result rejected: {0}")]
    Rejected(#[source] ValidationError),
}

/// Errors returned by agent operations.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent is failed and stays so until restarted.
    #[error("agent is failed: {0}")]
    Failed(Arc<ActionError>),
    /// `restart` was called on an agent that is not failed.
    #[error("agent does not need a restart")]
    NotFailed,
    /// The restart state was rejected by a validator.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// An action tried to wait for agents, which could deadlock the pool.
    #[error("can't await agents from inside an agent action")]
    AwaitInAction,
}
