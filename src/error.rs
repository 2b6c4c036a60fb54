//! Typed errors returned by the public API.
//!
//! Every fallible operation returns a [`BucketError`], which is either a
//! [`StoreError`] (the backend misbehaved) or a [`ContractError`] (the
//! caller violated a precondition). `try_consume`'s ordinary failure mode —
//! "not enough tokens yet" — is not an error at all; it is a `(false, ...)`
//! return, per the library's contract.

use thiserror::Error;

/// The embedded store failed in a way the library cannot recover from.
///
/// State on disk is whatever the aborted transaction left, i.e. unchanged.
#[derive(Debug, Error)]
#[error("sqlite store error: {0}")]
pub struct StoreError(#[from] rusqlite::Error);

/// The caller violated a documented precondition.
#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("rate must be positive, got {0}")]
    NonPositiveRate(f64),
    #[error("period must be positive, got {0}")]
    NonPositivePeriod(f64),
    #[error("n must be positive, got {0}")]
    NonPositiveN(f64),
    #[error("n ({n}) exceeds rate ({rate})")]
    NExceedsRate { n: f64, rate: f64 },
    #[error("timestamp must be finite, got {0}")]
    NonFiniteTimestamp(f64),
    #[error("set(n) requires 0 <= n <= rate, got {0}")]
    SetOutOfRange(f64),
    #[error("callback returned {got} timestamp(s), expected {expected}")]
    CallbackLengthMismatch { expected: usize, got: usize },
    #[error("callback returned timestamp {t} outside the window [{lo}, {hi}]")]
    CallbackOutOfWindow { t: f64, lo: f64, hi: f64 },
    #[error("callback's new window is not related to the observed one by addition/removal alone")]
    CallbackNotASubset,
}

/// The error type returned by every public operation on a bucket.
#[derive(Debug, Error)]
pub enum BucketError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl From<rusqlite::Error> for BucketError {
    fn from(err: rusqlite::Error) -> Self {
        BucketError::Store(StoreError::from(err))
    }
}

pub type Result<T> = std::result::Result<T, BucketError>;
