//! Wall-clock access, isolated so bucket logic never calls `SystemTime`
//! directly.
//!
//! Test builds get a thread-local override so unit tests can pin "now" to
//! an exact value and assert against the spec's worked examples instead of
//! fighting real wall-clock drift — mirroring how the teacher's own
//! `rate_limiter` tests take `now` as an explicit parameter rather than
//! calling `Utc::now()` inline.

use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(not(test))]
pub(crate) fn now() -> f64 {
    real_now()
}

#[cfg(test)]
thread_local! {
    static OVERRIDE: std::cell::Cell<Option<f64>> = std::cell::Cell::new(None);
}

#[cfg(test)]
pub(crate) fn now() -> f64 {
    OVERRIDE.with(|cell| cell.get()).unwrap_or_else(real_now)
}

/// Pins `now()` to `t` for the calling thread, until [`clear_for_test`] is
/// called. Test-only.
#[cfg(test)]
pub(crate) fn set_for_test(t: f64) {
    OVERRIDE.with(|cell| cell.set(Some(t)));
}

/// Reverts to the real wall clock for the calling thread. Test-only.
#[cfg(test)]
pub(crate) fn clear_for_test() {
    OVERRIDE.with(|cell| cell.set(None));
}

fn real_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}
