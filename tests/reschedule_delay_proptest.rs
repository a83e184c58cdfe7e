//! Property test for the reschedule delay function (spec.md §4.8): for any
//! attempt count and policy, the computed delay is bounded by
//! `max_delay_secs`, and exponential/fibonacci delays never decrease as the
//! attempt count grows.

use clusterd::domain::models::{compute_delay, DelayFunction};
use proptest::prelude::*;

proptest! {
    #[test]
    fn delay_never_exceeds_max(
        attempt in 0u32..40,
        base in 1u64..1000,
        max in 1u64..100_000,
        function in prop_oneof![
            Just(DelayFunction::Constant),
            Just(DelayFunction::Exponential),
            Just(DelayFunction::Fibonacci),
        ],
    ) {
        let delay = compute_delay(attempt, base, function, max);
        prop_assert!(delay <= max);
    }

    #[test]
    fn exponential_delay_is_monotonic_in_attempt(
        base in 1u64..1000,
        attempt in 0u32..30,
    ) {
        let max = u64::MAX / 2;
        let a = compute_delay(attempt, base, DelayFunction::Exponential, max);
        let b = compute_delay(attempt + 1, base, DelayFunction::Exponential, max);
        prop_assert!(b >= a);
    }

    #[test]
    fn fibonacci_delay_is_monotonic_in_attempt(
        base in 1u64..1000,
        attempt in 0u32..30,
    ) {
        let max = u64::MAX / 2;
        let a = compute_delay(attempt, base, DelayFunction::Fibonacci, max);
        let b = compute_delay(attempt + 1, base, DelayFunction::Fibonacci, max);
        prop_assert!(b >= a);
    }

    #[test]
    fn constant_delay_is_independent_of_attempt(
        base in 1u64..1000,
        attempt in 0u32..40,
    ) {
        let max = u64::MAX / 2;
        let delay = compute_delay(attempt, base, DelayFunction::Constant, max);
        prop_assert_eq!(delay, base);
    }
}
