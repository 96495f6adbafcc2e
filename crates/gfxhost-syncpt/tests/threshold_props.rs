use gfxhost_syncpt::threshold::{compare, is_expired};
use proptest::prelude::*;
use std::cmp::Ordering;

// (current, outstanding, offset) with `outstanding` below half the counter range so the
// window (current, current + outstanding] is unambiguous.
fn window() -> impl Strategy<Value = (u32, u32)> {
    (any::<u32>(), 0u32..0x4000_0000)
}

proptest! {
    #[test]
    fn thresholds_inside_window_expire_in_order((current, outstanding) in window(), step in 1u32..0x1000) {
        let future = current.wrapping_add(outstanding);
        let mut c = current;
        // Walk `current` toward `future`; once a threshold expires it stays expired.
        let thresh = current.wrapping_add(outstanding / 2 + 1);
        let mut seen_expired = false;
        while c != future {
            let expired = is_expired(c, Some(future), thresh);
            prop_assert!(!(seen_expired && !expired));
            seen_expired |= expired;
            let remaining = future.wrapping_sub(c);
            c = c.wrapping_add(step.min(remaining));
        }
        prop_assert!(is_expired(future, Some(future), thresh));
    }

    #[test]
    fn pending_iff_inside_window((current, outstanding) in window(), delta in any::<u32>()) {
        let future = current.wrapping_add(outstanding);
        let thresh = current.wrapping_add(delta);
        let inside = delta != 0 && delta <= outstanding;
        prop_assert_eq!(is_expired(current, Some(future), thresh), !inside);
    }

    #[test]
    fn compare_matches_distance_within_window((current, outstanding) in window(), a in 1u32..0x4000_0000, b in 1u32..0x4000_0000) {
        prop_assume!(a <= outstanding && b <= outstanding);
        let future = current.wrapping_add(outstanding);
        let ord = compare(current, Some(future), current.wrapping_add(a), current.wrapping_add(b));
        prop_assert_eq!(ord, a.cmp(&b));
    }

    #[test]
    fn compare_is_antisymmetric((current, outstanding) in window(), a in any::<u32>(), b in any::<u32>()) {
        let future = current.wrapping_add(outstanding);
        let ab = compare(current, Some(future), a, b);
        let ba = compare(current, Some(future), b, a);
        prop_assert_eq!(ab, ba.reverse());
        if a == b {
            prop_assert_eq!(ab, Ordering::Equal);
        }
    }
}
