//! The time-series bucket: a true sliding window enforcing "exactly `rate`
//! events per `period` seconds", backed by one row per consumed token in
//! `ts_token_bucket`.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, Transaction};

use crate::clock;
use crate::error::{BucketError, ContractError, Result};
use crate::store::{self, Store};

type TrimFn = dyn Fn(&Connection, &str, f64) -> Result<()>;

/// A sliding-window token bucket: at most `rate` consumptions may have
/// occurred in any window of `period` seconds ending now.
pub struct TimeSeriesTokenBucket {
    store: Store,
    key: String,
    rate: u32,
    period: f64,
    trim: Box<TrimFn>,
}

impl TimeSeriesTokenBucket {
    /// Opens a time-series bucket, using the default trim policy (delete
    /// rows older than `max(time) - period`, `max` taken over the key's
    /// entire history).
    pub fn new(path: impl AsRef<Path>, key: impl Into<String>, rate: u32, period: f64) -> Result<Self> {
        Self::with_trim(path, key, rate, period, default_trim)
    }

    /// Opens a time-series bucket with a caller-supplied trim policy, run
    /// after every `record` (including the one `try_consume`/`set` perform
    /// internally when adding rows).
    pub fn with_trim(
        path: impl AsRef<Path>,
        key: impl Into<String>,
        rate: u32,
        period: f64,
        trim: impl Fn(&Connection, &str, f64) -> Result<()> + 'static,
    ) -> Result<Self> {
        if rate == 0 {
            return Err(BucketError::Contract(ContractError::NonPositiveRate(rate as f64)));
        }
        if period <= 0.0 {
            return Err(BucketError::Contract(ContractError::NonPositivePeriod(period)));
        }
        Ok(Self {
            store: Store::open(path.as_ref())?,
            key: key.into(),
            rate,
            period,
            trim: Box::new(trim),
        })
    }

    /// Reads the token timestamps in `[query_time - period, query_time]`.
    /// `query_time` defaults to now. Returns `(tokens, times, query_time)`
    /// with `tokens = rate - times.len()`.
    ///
    /// Returns [`ContractError::NonFiniteTimestamp`] if an explicit
    /// `query_time` is given but not finite.
    pub fn peek(&self, query_time: Option<f64>) -> Result<(u32, Vec<f64>, f64)> {
        check_finite(query_time)?;
        self.store.with_immediate(|txn| {
            let qt = query_time.unwrap_or_else(clock::now);
            let times = self.peek_locked(txn, qt)?;
            let tokens = self.rate.saturating_sub(times.len() as u32);
            Ok((tokens, times, qt))
        })
    }

    /// Records one row per timestamp in `times`, then runs the trim policy.
    /// A no-op (including skipping trim) if `times` is empty.
    ///
    /// Returns [`ContractError::NonFiniteTimestamp`] if any timestamp is not
    /// finite.
    pub fn record(&self, times: &[f64]) -> Result<()> {
        for &t in times {
            if !t.is_finite() {
                return Err(BucketError::Contract(ContractError::NonFiniteTimestamp(t)));
            }
        }
        self.store.with_immediate(|txn| self.record_locked(txn, times))
    }

    /// Attempts to consume `n` tokens without waiting.
    ///
    /// Requires `0 < n <= rate`. Succeeds only if at least `n` tokens are
    /// available *and* strictly more than `leave` would remain. On success,
    /// inserts `n` rows at the query time. Returns
    /// `(success, tokens, times, query_time)`.
    pub fn try_consume(&self, n: u32, leave: Option<u32>) -> Result<(bool, u32, Vec<f64>, f64)> {
        self.check_n(n)?;
        let leave = leave.unwrap_or(0);
        self.store.with_immediate(|txn| {
            let qt = clock::now();
            let mut times = self.peek_locked(txn, qt)?;
            let tokens = self.rate.saturating_sub(times.len() as u32);
            if tokens >= n && tokens > leave {
                let new_times = vec![qt; n as usize];
                self.record_locked(txn, &new_times)?;
                times.extend(new_times);
                let remaining = tokens - n;
                tracing::debug!(key = %self.key, n, remaining, "gave token(s)");
                Ok((true, remaining, times, qt))
            } else {
                Ok((false, tokens, times, qt))
            }
        })
    }

    /// Consumes `n` tokens, blocking (via a plain sleep, never while a
    /// transaction is open) until they become available.
    pub fn consume(&self, n: u32, leave: Option<u32>) -> Result<(u32, Vec<f64>, f64)> {
        loop {
            let (success, tokens, times, query_time) = self.try_consume(n, leave)?;
            if success {
                return Ok((tokens, times, query_time));
            }
            let target = self.estimate_pure(&times, query_time, n);
            let now = clock::now();
            if target > now {
                let wait = target - now;
                tracing::debug!(key = %self.key, wait, "waiting for tokens");
                thread::sleep(Duration::from_secs_f64(wait));
            }
        }
    }

    /// Estimates the wall-clock time at which `n` tokens would be
    /// available, given the window as of `query_time` (defaulting to now).
    pub fn estimate(&self, n: u32, query_time: Option<f64>) -> Result<f64> {
        self.check_n(n)?;
        check_finite(query_time)?;
        let (_, times, qt) = self.peek(query_time)?;
        Ok(self.estimate_pure(&times, qt, n))
    }

    /// Reconciles the window against external truth.
    ///
    /// Reads the timestamps in `[query_time - period, query_time]`, passes
    /// them (and `query_time`) to `mutator`, and persists whatever it
    /// returns as the new window — inserting what it added, deleting what
    /// it removed. `mutator` runs *inside* the `begin_immediate`
    /// transaction; it must not itself touch the store or sleep.
    ///
    /// `mutator` returning `Err` aborts the transaction, leaving state
    /// unchanged. A `ContractError::CallbackOutOfWindow` is raised if any
    /// returned timestamp falls outside the window.
    pub fn mutate(
        &self,
        mutator: impl Fn(&[f64], f64) -> Result<Vec<f64>>,
        query_time: Option<f64>,
    ) -> Result<(u32, Vec<f64>, f64)> {
        check_finite(query_time)?;
        self.store.with_immediate(|txn| {
            let qt = query_time.unwrap_or_else(clock::now);
            let old_times = self.peek_locked(txn, qt)?;
            let new_times = mutator(&old_times, qt)?;
            for &t in &new_times {
                if !(t >= qt - self.period && t <= qt) {
                    return Err(BucketError::Contract(ContractError::CallbackOutOfWindow {
                        t,
                        lo: qt - self.period,
                        hi: qt,
                    }));
                }
            }
            let (to_add, to_delete) = multiset_diff(&old_times, &new_times);
            if !to_add.is_empty() {
                self.record_locked(txn, &to_add)?;
            }
            if !to_delete.is_empty() {
                self.delete_locked(txn, &to_delete)?;
            }
            let tokens = self.rate.saturating_sub(new_times.len() as u32);
            Ok((tokens, new_times, qt))
        })
    }

    /// Ensures exactly `rate - n` rows live in the window, filling or
    /// pruning as needed. `fill`/`prune` default to "all at `query_time`"
    /// and "uniform random sample" respectively. Returns the new window.
    pub fn set(
        &self,
        n: u32,
        query_time: Option<f64>,
        fill: Option<&dyn Fn(&[f64], f64, usize) -> Vec<f64>>,
        prune: Option<&dyn Fn(&[f64], f64, usize) -> Vec<f64>>,
    ) -> Result<Vec<f64>> {
        if n > self.rate {
            return Err(BucketError::Contract(ContractError::SetOutOfRange(n as f64)));
        }
        let rate = self.rate;
        let period = self.period;
        let mutator = move |times: &[f64], qt: f64| -> Result<Vec<f64>> {
            let tokens = rate.saturating_sub(times.len() as u32);
            if tokens > n {
                let missing = (tokens - n) as usize;
                let added = match fill {
                    Some(f) => f(times, qt, missing),
                    None => vec![qt; missing],
                };
                validate_fill(&added, missing, qt, period)?;
                let mut combined = times.to_vec();
                combined.extend(added);
                Ok(combined)
            } else if tokens < n {
                let excess = (n - tokens) as usize;
                let pruned = match prune {
                    Some(p) => p(times, qt, excess),
                    None => default_prune(times, excess),
                };
                validate_prune(times, &pruned, excess)?;
                Ok(subtract_multiset(times, &pruned))
            } else {
                Ok(times.to_vec())
            }
        };
        let (_, new_times, _) = self.mutate(mutator, query_time)?;
        Ok(new_times)
    }

    fn check_n(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(BucketError::Contract(ContractError::NonPositiveN(0.0)));
        }
        if n > self.rate {
            return Err(BucketError::Contract(ContractError::NExceedsRate {
                n: n as f64,
                rate: self.rate as f64,
            }));
        }
        Ok(())
    }

    fn estimate_pure(&self, times: &[f64], query_time: f64, n: u32) -> f64 {
        let offset = (self.rate - n) as usize;
        if offset >= times.len() {
            return query_time;
        }
        let mut sorted = times.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).expect("timestamps are never NaN"));
        sorted[offset] + self.period
    }

    fn peek_locked(&self, txn: &mut Transaction<'_>, query_time: f64) -> Result<Vec<f64>> {
        store::with_savepoint(txn, |sp| {
            let mut stmt = sp.prepare(
                "select time from ts_token_bucket where key = ?1 and time >= ?2 and time <= ?3 \
                 order by time",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![self.key, query_time - self.period, query_time],
                |row| row.get(0),
            )?;
            let mut times = Vec::new();
            for row in rows {
                times.push(row?);
            }
            Ok(times)
        })
    }

    fn record_locked(&self, txn: &mut Transaction<'_>, times: &[f64]) -> Result<()> {
        if times.is_empty() {
            return Ok(());
        }
        store::with_savepoint(txn, |sp| {
            {
                let mut stmt =
                    sp.prepare_cached("insert into ts_token_bucket (key, time) values (?1, ?2)")?;
                for t in times {
                    stmt.execute(rusqlite::params![self.key, t])?;
                }
            }
            (self.trim)(sp, &self.key, self.period)
        })
    }

    fn delete_locked(&self, txn: &mut Transaction<'_>, times: &[f64]) -> Result<()> {
        store::with_savepoint(txn, |sp| {
            let mut stmt = sp.prepare_cached(
                "delete from ts_token_bucket where rowid = (select rowid from ts_token_bucket \
                 where key = ?1 and time = ?2 limit 1)",
            )?;
            for t in times {
                stmt.execute(rusqlite::params![self.key, t])?;
            }
            Ok(())
        })
    }
}

fn check_finite(query_time: Option<f64>) -> Result<()> {
    if let Some(t) = query_time {
        if !t.is_finite() {
            return Err(BucketError::Contract(ContractError::NonFiniteTimestamp(t)));
        }
    }
    Ok(())
}

/// Default trim policy: delete every row older than `max(time) - period`,
/// where `max` ranges over the key's *entire* history, not just the active
/// window. Documented open question: this over-trims under clock skew; a
/// caller wanting `now - period` instead should pass a custom trim via
/// [`TimeSeriesTokenBucket::with_trim`].
fn default_trim(conn: &Connection, key: &str, period: f64) -> Result<()> {
    let latest: Option<f64> = conn.query_row(
        "select max(time) from ts_token_bucket where key = ?1",
        [key],
        |row| row.get(0),
    )?;
    if let Some(latest) = latest {
        conn.execute(
            "delete from ts_token_bucket where key = ?1 and time < ?2",
            rusqlite::params![key, latest - period],
        )?;
    }
    Ok(())
}

fn default_prune(times: &[f64], k: usize) -> Vec<f64> {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    times
        .choose_multiple(&mut rng, k)
        .copied()
        .collect()
}

fn validate_fill(new: &[f64], expected_len: usize, query_time: f64, period: f64) -> Result<()> {
    if new.len() != expected_len {
        return Err(BucketError::Contract(ContractError::CallbackLengthMismatch {
            expected: expected_len,
            got: new.len(),
        }));
    }
    for &t in new {
        if !(t >= query_time - period && t <= query_time) {
            return Err(BucketError::Contract(ContractError::CallbackOutOfWindow {
                t,
                lo: query_time - period,
                hi: query_time,
            }));
        }
    }
    Ok(())
}

fn validate_prune(times: &[f64], pruned: &[f64], expected_len: usize) -> Result<()> {
    if pruned.len() != expected_len {
        return Err(BucketError::Contract(ContractError::CallbackLengthMismatch {
            expected: expected_len,
            got: pruned.len(),
        }));
    }
    let mut counts: HashMap<u64, i64> = HashMap::new();
    for t in times {
        *counts.entry(t.to_bits()).or_insert(0) += 1;
    }
    for t in pruned {
        let c = counts.entry(t.to_bits()).or_insert(0);
        *c -= 1;
        if *c < 0 {
            return Err(BucketError::Contract(ContractError::CallbackNotASubset));
        }
    }
    Ok(())
}

fn subtract_multiset(times: &[f64], remove: &[f64]) -> Vec<f64> {
    let mut remove_counts: HashMap<u64, i64> = HashMap::new();
    for t in remove {
        *remove_counts.entry(t.to_bits()).or_insert(0) += 1;
    }
    let mut result = Vec::with_capacity(times.len());
    for &t in times {
        let c = remove_counts.entry(t.to_bits()).or_insert(0);
        if *c > 0 {
            *c -= 1;
        } else {
            result.push(t);
        }
    }
    result
}

/// Computes `(to_add, to_delete)` such that applying them to `old` (as a
/// multiset) yields `new`, preserving duplicate counts.
fn multiset_diff(old: &[f64], new: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut counts: HashMap<u64, (f64, i64)> = HashMap::new();
    for &t in old {
        counts.entry(t.to_bits()).or_insert((t, 0)).1 -= 1;
    }
    for &t in new {
        counts.entry(t.to_bits()).or_insert((t, 0)).1 += 1;
    }
    let mut to_add = Vec::new();
    let mut to_delete = Vec::new();
    for (value, diff) in counts.into_values() {
        if diff > 0 {
            to_add.extend(std::iter::repeat(value).take(diff as usize));
        } else if diff < 0 {
            to_delete.extend(std::iter::repeat(value).take((-diff) as usize));
        }
    }
    (to_add, to_delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn bucket(rate: u32, period: f64) -> TimeSeriesTokenBucket {
        let file = NamedTempFile::new().unwrap();
        let path = file.into_temp_path().keep().unwrap();
        TimeSeriesTokenBucket::new(path, "k", rate, period).unwrap()
    }

    #[test]
    fn rejects_zero_rate() {
        let file = NamedTempFile::new().unwrap();
        assert!(TimeSeriesTokenBucket::new(file.path(), "k", 0, 10.0).is_err());
    }

    #[test]
    fn fresh_bucket_is_empty() {
        let b = bucket(3, 10.0);
        let (tokens, times, _) = b.peek(Some(0.0)).unwrap();
        assert_eq!(tokens, 3);
        assert!(times.is_empty());
    }

    #[test]
    fn exactness_of_the_sliding_window() {
        let b = bucket(3, 10.0);
        b.record(&[0.0, 1.0, 2.0]).unwrap();

        let (tokens, _, _) = b.peek(Some(5.0)).unwrap();
        assert_eq!(tokens, 0);

        let target = b.estimate(1, Some(5.0)).unwrap();
        assert_eq!(target, 10.0);

        let (tokens, _, _) = b.peek(Some(10.1)).unwrap();
        assert_eq!(tokens, 1);
    }

    #[test]
    fn try_consume_rejects_n_outside_one_to_rate() {
        let b = bucket(3, 10.0);
        assert!(b.try_consume(0, None).is_err());
        assert!(b.try_consume(4, None).is_err());
    }

    #[test]
    fn set_fills_the_window_to_the_requested_level() {
        // Mirrors the spec's worked example: rate=3, record(0, 1), then
        // set(0, query_time=5) should leave exactly 3 rows in the window
        // (0 tokens available), adding one filler timestamp at qt.
        let b = bucket(3, 10.0);
        b.record(&[0.0, 1.0]).unwrap();
        let times = b.set(0, Some(5.0), None, None).unwrap();
        assert_eq!(times.len(), 3);
        assert!(times.contains(&0.0));
        assert!(times.contains(&1.0));
        assert!(times.contains(&5.0));
        let (tokens, _, _) = b.peek(Some(5.0)).unwrap();
        assert_eq!(tokens, 0);
    }

    #[test]
    fn set_prunes_with_a_deterministic_callback() {
        let b = bucket(3, 10.0);
        b.record(&[0.0, 1.0, 2.0]).unwrap();
        let prune = |times: &[f64], _qt: f64, k: usize| -> Vec<f64> {
            let mut sorted = times.to_vec();
            sorted.sort_by(|a, c| a.partial_cmp(c).unwrap());
            sorted.into_iter().take(k).collect()
        };
        // rate=3, 3 rows present (0 tokens available), asking for n=2
        // tokens available means 1 row should remain: prune the two
        // oldest (0.0, 1.0), keeping 2.0.
        let times = b.set(2, Some(5.0), None, Some(&prune)).unwrap();
        assert_eq!(times, vec![2.0]);
    }

    #[test]
    fn mutate_rejects_a_timestamp_outside_the_window() {
        let b = bucket(3, 10.0);
        b.record(&[5.0]).unwrap();
        let before = b.peek(Some(5.0)).unwrap().1;

        let result = b.mutate(|_times, qt| Ok(vec![qt + 100.0]), Some(5.0));
        assert!(result.is_err());

        let after = b.peek(Some(5.0)).unwrap().1;
        assert_eq!(before, after);
    }

    #[test]
    fn record_then_peek_round_trips_a_timestamp() {
        let b = bucket(3, 10.0);
        b.record(&[7.0]).unwrap();
        let (_, times, _) = b.peek(Some(7.0)).unwrap();
        assert!(times.contains(&7.0));
        let (_, times, _) = b.peek(Some(20.0)).unwrap();
        assert!(!times.contains(&7.0));
    }
}
