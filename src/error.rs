//! Typed error taxonomy for the indexing pipeline.
//!
//! The Orchestrator classifies every error it sees into one of four buckets:
//! transient, recoverable-invariant, data-shape, or fatal-config. Only the
//! first is retried; the rest are logged and the caller continues.

use thiserror::Error;

/// Errors raised by the Chain Reader.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc call failed after retries: {0}")]
    Transient(String),

    #[error("could not decode event payload: {0}")]
    DataShape(String),

    #[error("chain reader misconfigured: {0}")]
    Config(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Errors raised by the Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("row violates an invariant: {0}")]
    Invariant(String),
}

/// Errors raised while applying a single decoded event.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Logged as a warning; the event's own transaction still rolls back,
    /// but the batch is not aborted.
    #[error("recoverable invariant violation: {0}")]
    RecoverableInvariant(String),
}

/// Top-level error surfaced to the Orchestrator / Scheduler.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the Orchestrator should mark the sub-indexer ERROR and let
    /// the Scheduler retry on the next tick, vs. something that was already
    /// handled inline (recoverable-invariant / data-shape errors never reach
    /// this far, they are swallowed at the Applier).
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Chain(e) => e.is_transient(),
            PipelineError::Store(_) => true,
            PipelineError::Apply(_) => false,
            PipelineError::Config(_) => false,
        }
    }
}
