//! The classic continuously-refilling bucket, and its scheduled sibling.
//!
//! Both share one schema (table `tbf`, one row per key) and one state
//! machine; they differ only in how tokens refill between observations,
//! which is captured by the [`RefillPolicy`] type parameter rather than by
//! subclassing.

use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::{OptionalExtension, Transaction};

use crate::clock;
use crate::error::{BucketError, ContractError, Result};
use crate::policy::{Continuous, RefillPolicy, Scheduled};
use crate::store::{self, Store};

/// A classic token bucket: continuous linear refill up to `rate`.
pub type TokenBucket = GenericTokenBucket<Continuous>;

/// A token bucket that resets to full at fixed wall-clock boundaries
/// (`now % period == 0`), anchored to the Unix epoch.
pub type ScheduledTokenBucket = GenericTokenBucket<Scheduled>;

/// Shared state machine for the `tbf`-table bucket variants.
///
/// `P` supplies the refill/estimation discipline; see [`crate::policy`].
pub struct GenericTokenBucket<P: RefillPolicy> {
    store: Store,
    key: String,
    rate: f64,
    period: f64,
    policy: P,
}

impl<P: RefillPolicy + Default> GenericTokenBucket<P> {
    /// Opens a bucket identified by `(path, key)`, using `rate` tokens per
    /// `period` seconds.
    ///
    /// Returns [`ContractError`] if `rate` or `period` is not positive.
    pub fn new(path: impl AsRef<Path>, key: impl Into<String>, rate: f64, period: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(BucketError::Contract(ContractError::NonPositiveRate(rate)));
        }
        if period <= 0.0 {
            return Err(BucketError::Contract(ContractError::NonPositivePeriod(period)));
        }
        Ok(Self {
            store: Store::open(path.as_ref())?,
            key: key.into(),
            rate,
            period,
            policy: P::default(),
        })
    }
}

impl<P: RefillPolicy> GenericTokenBucket<P> {
    /// Reads the current `(tokens, last)` state, applying refill up to now
    /// and persisting the refreshed state.
    pub fn peek(&self) -> Result<(f64, f64)> {
        self.store.with_immediate(|txn| self.peek_locked(txn))
    }

    /// Explicitly sets the bucket's state. `tokens` is clamped to
    /// `[0, rate]`; `timestamp` defaults to now.
    ///
    /// Returns [`ContractError::NonFiniteTimestamp`] if an explicit
    /// timestamp is given but not finite.
    pub fn set(&self, tokens: f64, timestamp: Option<f64>) -> Result<(f64, f64)> {
        if let Some(ts) = timestamp {
            if !ts.is_finite() {
                return Err(BucketError::Contract(ContractError::NonFiniteTimestamp(ts)));
            }
        }
        self.store
            .with_immediate(|txn| self.set_locked(txn, tokens, timestamp))
    }

    /// Attempts to consume `n` tokens without waiting.
    ///
    /// Succeeds only if at least `n` tokens are available *and* strictly
    /// more than `leave` would remain; see the module docs on this
    /// deliberate asymmetry. Returns `(success, tokens, last)`.
    pub fn try_consume(&self, n: f64, leave: Option<f64>) -> Result<(bool, f64, f64)> {
        if n <= 0.0 {
            return Err(BucketError::Contract(ContractError::NonPositiveN(n)));
        }
        let leave = leave.unwrap_or(0.0);
        self.store.with_immediate(|txn| {
            let (tokens, last) = self.peek_locked(txn)?;
            if tokens >= n && tokens > leave {
                let (tokens, last) = self.set_locked(txn, tokens - n, Some(last))?;
                tracing::debug!(key = %self.key, n, remaining = tokens, "gave token(s)");
                Ok((true, tokens, last))
            } else {
                Ok((false, tokens, last))
            }
        })
    }

    /// Consumes `n` tokens, blocking (via a plain sleep, never while a
    /// transaction is open) until they become available.
    pub fn consume(&self, n: f64, leave: Option<f64>) -> Result<(f64, f64)> {
        if n <= 0.0 {
            return Err(BucketError::Contract(ContractError::NonPositiveN(n)));
        }
        loop {
            let (success, tokens, last) = self.try_consume(n, leave)?;
            if success {
                return Ok((tokens, last));
            }
            let now = clock::now();
            let target = self.policy.estimate(tokens, last, n, now, self.rate, self.period);
            if target > now {
                let wait = target - now;
                tracing::debug!(key = %self.key, wait, "waiting for tokens");
                thread::sleep(Duration::from_secs_f64(wait));
            }
        }
    }

    fn peek_locked(&self, txn: &mut Transaction<'_>) -> Result<(f64, f64)> {
        store::with_savepoint(txn, |sp| {
            let row: Option<(f64, f64)> = sp
                .query_row(
                    "select tokens, last from tbf where key = ?1",
                    [&self.key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let now = clock::now();
            let (tokens, last) = row.unwrap_or((self.rate, now));
            let (tokens, last) = self.policy.update(tokens, last, now, self.rate, self.period);
            self.write_state(sp, tokens, last)
        })
    }

    fn set_locked(
        &self,
        txn: &mut Transaction<'_>,
        tokens: f64,
        timestamp: Option<f64>,
    ) -> Result<(f64, f64)> {
        store::with_savepoint(txn, |sp| {
            let last = timestamp.unwrap_or_else(clock::now);
            self.write_state(sp, tokens, last)
        })
    }

    fn write_state(
        &self,
        conn: &rusqlite::Connection,
        tokens: f64,
        last: f64,
    ) -> Result<(f64, f64)> {
        let tokens = tokens.clamp(0.0, self.rate);
        conn.execute(
            "insert or replace into tbf (key, tokens, last) values (?1, ?2, ?3)",
            rusqlite::params![self.key, tokens, last],
        )?;
        Ok((tokens, last))
    }
}
