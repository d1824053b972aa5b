//! Offset arithmetic.
//!
//! Peer `k` of `N` fires `k/N` of the way through each cadence window.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::warn;

/// Phase in whole seconds for the peer at `position` among `live_count`
/// peers, clamped to `[0, cadence_secs]`.
///
/// Returns 0 until both a rank and a count are known.  `position` can
/// briefly exceed `live_count - 1` while the fleet rebalances; the result is
/// clamped rather than rejected.
pub fn compute_offset(cadence_secs: i64, live_count: i64, position: i64) -> i64 {
    if live_count <= 0 || position < 0 {
        return 0;
    }

    let offset = cadence_secs.saturating_mul(position) / live_count;

    if offset > cadence_secs {
        warn!(
            offset,
            cadence_secs, live_count, position, "offset is more than cadence, clamping"
        );
        return cadence_secs.max(0);
    }

    offset.max(0)
}

/// Time left until the next wall-clock minute boundary.  A full minute when
/// `now` sits exactly on a boundary.
pub fn duration_until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::from_secs(u64::from(now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    Duration::from_secs(60).saturating_sub(into_minute)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn single_instance_has_no_offset() {
        assert_eq!(compute_offset(60, 1, 0), 0);
    }

    #[test]
    fn three_instances_split_a_minute() {
        let offsets: Vec<i64> = (0..3).map(|p| compute_offset(60, 3, p)).collect();
        assert_eq!(offsets, vec![0, 20, 40]);
    }

    #[test]
    fn two_instances_split_a_minute() {
        assert_eq!(compute_offset(60, 2, 0), 0);
        assert_eq!(compute_offset(60, 2, 1), 30);
    }

    #[test]
    fn sixty_instances_one_second_apart() {
        assert_eq!(compute_offset(60, 60, 59), 59);
    }

    #[test]
    fn unknown_rank_or_count_is_zero() {
        assert_eq!(compute_offset(60, 0, 2), 0);
        assert_eq!(compute_offset(60, -1, 2), 0);
        assert_eq!(compute_offset(60, 3, -1), 0);
    }

    #[test]
    fn stale_position_is_clamped() {
        // Position 4 among 2 live peers: raw offset would be 120s.
        assert_eq!(compute_offset(60, 2, 4), 60);
    }

    #[test]
    fn minute_alignment() {
        let at = |s, ms| {
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, s).unwrap()
                + chrono::Duration::milliseconds(ms)
        };
        assert_eq!(duration_until_next_minute(at(0, 0)), Duration::from_secs(60));
        assert_eq!(duration_until_next_minute(at(15, 0)), Duration::from_secs(45));
        assert_eq!(
            duration_until_next_minute(at(59, 500)),
            Duration::from_millis(500)
        );
    }

    proptest! {
        #[test]
        fn offset_is_non_decreasing_in_position(c in 1i64..3600, n in 1i64..200) {
            prop_assert_eq!(compute_offset(c, n, 0), 0);
            let mut last = 0;
            for p in 0..n {
                let off = compute_offset(c, n, p);
                prop_assert!(off >= last);
                last = off;
            }
        }

        #[test]
        fn offset_never_exceeds_cadence(c in 0i64..3600, n in -5i64..200, p in -5i64..1000) {
            let off = compute_offset(c, n, p);
            prop_assert!(off >= 0);
            prop_assert!(off <= c);
        }

        #[test]
        fn offsets_spread_evenly(c in 1i64..3600, n in 1i64..120) {
            for p in 0..n {
                let ideal = c as f64 * p as f64 / n as f64;
                let off = compute_offset(c, n, p) as f64;
                prop_assert!(off <= ideal && ideal - off < 1.0);
            }
        }

        #[test]
        fn alignment_is_within_a_minute(secs in 0u32..60, nanos in 0u32..1_000_000_000) {
            let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
                + chrono::Duration::nanoseconds(i64::from(nanos));
            let wait = duration_until_next_minute(now);
            prop_assert!(wait > Duration::ZERO);
            prop_assert!(wait <= Duration::from_secs(60));
        }
    }
}
