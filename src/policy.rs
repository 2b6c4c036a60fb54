//! Refill/estimation strategies shared by the Classic and Scheduled buckets.
//!
//! The reference implementation gets this by subclassing `TokenBucket` and
//! overriding `_update`/`_estimate`. Rust has no subclassing, so the two
//! disciplines are expressed as implementations of [`RefillPolicy`], and
//! [`crate::classic::GenericTokenBucket`] is monomorphized over whichever
//! one a bucket alias picks.

/// Given the last known state of a bucket and the current time, answers two
/// questions: what is the bucket's state *now* (`update`), and when would
/// `n` tokens be available (`estimate`)?
pub trait RefillPolicy {
    /// Projects `(tokens, last)` forward to `now`, returning the
    /// authoritative `(tokens, last)` pair to persist. `tokens` is not yet
    /// clamped to `[0, rate]`; the caller does that uniformly for every
    /// policy.
    fn update(&self, tokens: f64, last: f64, now: f64, rate: f64, period: f64) -> (f64, f64);

    /// Returns the wall-clock time at which `n` tokens would be available,
    /// given the last known `(tokens, last)` state observed at `now`.
    fn estimate(&self, tokens: f64, last: f64, n: f64, now: f64, rate: f64, period: f64) -> f64;
}

/// Continuous linear refill: tokens accrue at `rate / period` per second, up
/// to `rate`. This is the "classic" token bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Continuous;

impl RefillPolicy for Continuous {
    fn update(&self, tokens: f64, last: f64, now: f64, rate: f64, period: f64) -> (f64, f64) {
        let elapsed = now - last;
        (tokens + elapsed * rate / period, now)
    }

    fn estimate(&self, tokens: f64, last: f64, n: f64, _now: f64, rate: f64, period: f64) -> f64 {
        last + (n - tokens) * period / rate
    }
}

/// Discrete reset at fixed wall-clock boundaries anchored to the Unix
/// epoch: the bucket jumps to `rate` tokens whenever `now` crosses a
/// multiple of `period`, and holds steady (no accrual) between boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduled;

impl Scheduled {
    fn last_refill(now: f64, period: f64) -> f64 {
        now - (now % period)
    }
}

impl RefillPolicy for Scheduled {
    fn update(&self, tokens: f64, last: f64, now: f64, rate: f64, period: f64) -> (f64, f64) {
        let last_refill = Self::last_refill(now, period);
        if last_refill > last {
            (rate, last_refill)
        } else {
            (tokens, now)
        }
    }

    fn estimate(&self, tokens: f64, _last: f64, n: f64, now: f64, _rate: f64, period: f64) -> f64 {
        if tokens >= n {
            now
        } else {
            Self::last_refill(now, period) + period
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_refills_linearly() {
        let (tokens, last) = Continuous.update(7.0, 0.0, 5.0, 10.0, 10.0);
        assert_eq!(last, 5.0);
        assert!((tokens - 12.0).abs() < 1e-9);
    }

    #[test]
    fn scheduled_holds_steady_before_a_boundary() {
        let (tokens, last) = Scheduled.update(0.0, 59.0, 59.5, 5.0, 60.0);
        assert_eq!(tokens, 0.0);
        assert_eq!(last, 59.5);
    }

    #[test]
    fn scheduled_resets_to_full_after_a_boundary() {
        let (tokens, last) = Scheduled.update(0.0, 59.0, 60.5, 5.0, 60.0);
        assert_eq!(tokens, 5.0);
        assert_eq!(last, 60.0);
    }

    #[test]
    fn scheduled_estimate_waits_for_next_boundary() {
        let target = Scheduled.estimate(0.0, 59.0, 1.0, 59.5, 5.0, 60.0);
        assert_eq!(target, 60.0);
    }
}
