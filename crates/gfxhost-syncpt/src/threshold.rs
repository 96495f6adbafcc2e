//! Wrap-aware syncpoint threshold arithmetic.
//!
//! Syncpoint values are free-running `u32` counters, so every comparison is done modulo 2^32.
//! Given
//!
//! - `c`: the current value,
//! - `f`: the future value (`max`), which `c` chases but never passes,
//! - `t`: the threshold being tested,
//!
//! a threshold is expired when `(f - t) >= (c - t)`. Note that this is *not* the same as
//! `f >= c` once both sides wrap; the subtraction of `t` must stay on both sides.
//!
//! Thresholds outside of `(c, f]` are treated as expired: a waiter for a value nobody has
//! promised to reach would otherwise hang forever.
//!
//! Client-managed syncpoints have no meaningful `max`, so they fall back to a signed
//! distance test.

use core::cmp::Ordering;

/// Returns `true` if `thresh` has been reached.
///
/// `future` is `None` for client-managed syncpoints.
pub fn is_expired(current: u32, future: Option<u32>, thresh: u32) -> bool {
    match future {
        Some(future) => future.wrapping_sub(thresh) >= current.wrapping_sub(thresh),
        None => (current.wrapping_sub(thresh) as i32) >= 0,
    }
}

/// Orders `a` and `b` relative to `reference`, assuming both trigger on the same side of it.
pub fn compare_ref(reference: u32, a: u32, b: u32) -> Ordering {
    a.wrapping_sub(reference).cmp(&b.wrapping_sub(reference))
}

/// Orders two thresholds by which one triggers first.
pub fn compare(current: u32, future: Option<u32>, a: u32, b: u32) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a_expired = is_expired(current, future, a);
    let b_expired = is_expired(current, future, b);
    match (a_expired, b_expired) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // Both on the same side of `current`, so it is a valid reference point.
        _ => compare_ref(current, a, b),
    }
}

/// Returns `true` if `a` is strictly ahead of `b` (within half of the counter range).
pub fn is_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
