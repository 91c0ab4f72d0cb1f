//! Engine error model.

use relay_core::RecordId;

use crate::ledger::LedgerError;

/// Errors surfaced by supervisors and the saga context.
///
/// `Validation` and `HandlerNotFound` are caller/configuration errors and
/// never create or retry a record; `Handler` carries a runtime dispatch
/// failure that has already been captured onto the record.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Structural payload validation failed; no record was created.
    #[error("payload validation failed: {0}")]
    Validation(String),

    /// No handler registered for the work type. Fatal configuration error,
    /// never recorded or retried.
    #[error("no handler registered for work type '{0}'")]
    HandlerNotFound(String),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    /// The record refused `begin` at creation time (e.g. a zero try limit).
    #[error("record {0} is not eligible to run")]
    NotEligible(RecordId),

    /// The resume fast-forward loop hit its iteration cap without the
    /// backoff policy advancing `next_try_time`.
    #[error("resume failed to advance next_try_time for record {0}")]
    ResumeStalled(RecordId),

    /// The engine was dropped while work was still queued.
    #[error("engine is shut down")]
    Shutdown,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A handler or interceptor failed at runtime.
    #[error("dispatch failed: {0:#}")]
    Handler(anyhow::Error),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Handler(err)
    }
}
