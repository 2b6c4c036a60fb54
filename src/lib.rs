//! Persistent, multi-process token-bucket rate limiting.
//!
//! This crate lets cooperating callers — potentially spread across several
//! OS processes on the same machine — share rate-limit state against an
//! external resource (typically a third-party API with a low request
//! quota), so that the combined rate of requests stays within a configured
//! envelope. State lives in a SQLite database file; independent callers
//! coordinate purely through its write lock, with no in-memory singleton
//! and no network coordination.
//!
//! Three bucket disciplines are provided:
//!
//! - [`classic::TokenBucket`] — continuous linear refill up to a ceiling.
//! - [`classic::ScheduledTokenBucket`] — resets to full at fixed wall-clock
//!   boundaries (every `period` seconds, anchored to the Unix epoch).
//! - [`timeseries::TimeSeriesTokenBucket`] — a true sliding window
//!   enforcing "exactly `rate` events per `period` seconds", with support
//!   for reconciling the local model against externally-reported truth.
//!
//! # Example
//!
//! ```
//! use tbucket::classic::TokenBucket;
//! # let dir = tempfile::tempdir().unwrap();
//! # let path = dir.path().join("buckets.db");
//!
//! let bucket = TokenBucket::new(&path, "github-api", 10.0, 60.0)?;
//! let (success, tokens, _) = bucket.try_consume(1.0, None)?;
//! assert!(success);
//! assert_eq!(tokens, 9.0);
//! # Ok::<(), tbucket::error::BucketError>(())
//! ```

pub mod classic;
mod clock;
pub mod error;
pub mod policy;
mod store;
pub mod timeseries;

pub use crate::classic::{GenericTokenBucket, ScheduledTokenBucket, TokenBucket};
pub use crate::error::{BucketError, ContractError, StoreError};
pub use crate::timeseries::TimeSeriesTokenBucket;
