//! Error kinds for the scheduling core.
//!
//! These are kinds, not faults: [`KvError::ConditionFailed`] in
//! particular is the expected outcome of losing a race and callers are
//! expected to match on it rather than treat it as a bug.

use thiserror::Error;

/// Errors surfaced by a [`crate::kv::KvStore`] implementation.
///
/// The KV abstraction is the only place that translates a concrete
/// store's errors into the core's vocabulary; everything above this
/// layer deals only in `KvError`.
#[derive(Debug, Error)]
pub enum KvError {
    /// A conditional put/update/delete lost its race. Not a fault.
    #[error("condition failed")]
    ConditionFailed,

    /// The underlying store is unavailable, throttling, or otherwise
    /// degraded. Callers should back off; the worker treats this as a
    /// job failure.
    #[error("transient store error: {0}")]
    TransientStoreError(String),

    /// A stored sort key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Errors raised while validating and routing a job to its handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered for the job's `job_type`.
    #[error("no handler registered for job type {0:?}")]
    NoHandler(String),

    /// The stored payload failed the handler's declared schema.
    #[error("payload invalid for job type {job_type:?}: {reason}")]
    PayloadInvalid { job_type: String, reason: String },

    /// The handler itself returned an error.
    #[error("handler error: {0}")]
    HandlerError(String),
}

/// Missing or invalid configuration at startup. Always fatal.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Errors from leader-lease operations other than a lost race.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Top-level error type unifying every kind this crate can surface.
///
/// Job-processing failures (`Dispatch`, most `Kv` variants) are
/// recovered locally by the [`crate::worker::Worker`] and never
/// propagate this far in normal operation; this enum exists for
/// operations — lease management, configuration loading, cleanup —
/// that have no local recovery path.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}
