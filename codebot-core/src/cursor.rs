//! Poll cursor math.
//!
//! GitHub's `since` filter has second granularity and a poll cycle takes
//! real time, so every window overlaps the previous one. Re-fetched events
//! are dropped by the dedup gate; a skipped window is never recovered.

use chrono::{DateTime, Duration, Utc};

/// Margin subtracted from PR creation time on the first poll.
pub const FIRST_POLL_MARGIN_SECS: i64 = 60;

/// Overlap subtracted from the stored cursor on later polls.
pub const CURSOR_OVERLAP_SECS: i64 = 30;

/// Look-back used on a first poll when the PR creation time is unknown.
pub const FALLBACK_LOOKBACK_HOURS: i64 = 24;

/// Compute the lower bound of the next fetch window.
pub fn lower_bound(
    cursor: Option<DateTime<Utc>>,
    pr_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match (cursor, pr_created_at) {
        (Some(last), _) => last - Duration::seconds(CURSOR_OVERLAP_SECS),
        (None, Some(created)) => created - Duration::seconds(FIRST_POLL_MARGIN_SECS),
        (None, None) => now - Duration::hours(FALLBACK_LOOKBACK_HOURS),
    }
}

/// Render a bound for the `since` query parameter.
pub fn format_since(bound: DateTime<Utc>) -> String {
    bound.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// How the fetches of one poll cycle went for a single PR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl FetchOutcome {
    pub fn record<T, E>(&mut self, result: &Result<T, E>) {
        if result.is_ok() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Decide the cursor value to store after a cycle, or `None` to keep the
/// current one.
///
/// The cursor moves to the cycle start when every fetch succeeded, or when
/// the PR had no cursor yet and at least one fetch succeeded. It never moves
/// backwards.
pub fn next_cursor(
    previous: Option<DateTime<Utc>>,
    cycle_started_at: DateTime<Utc>,
    outcome: FetchOutcome,
) -> Option<DateTime<Utc>> {
    let safe = outcome.failed == 0 || (previous.is_none() && outcome.succeeded > 0);
    if !safe {
        return None;
    }
    match previous {
        Some(prev) if prev >= cycle_started_at => None,
        _ => Some(cycle_started_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_poll_uses_creation_minus_minute() {
        assert_eq!(lower_bound(None, Some(t(0)), t(500)), t(-60));
    }

    #[test]
    fn test_later_poll_uses_cursor_minus_thirty_seconds() {
        assert_eq!(lower_bound(Some(t(100)), Some(t(0)), t(500)), t(70));
    }

    #[test]
    fn test_first_poll_without_creation_time() {
        assert_eq!(
            lower_bound(None, None, t(0)),
            t(0) - Duration::hours(FALLBACK_LOOKBACK_HOURS)
        );
    }

    #[test]
    fn test_format_since_drops_subseconds() {
        let bound = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + Duration::milliseconds(750);
        assert_eq!(format_since(bound), "2024-03-05T07:08:09Z");
    }

    #[test]
    fn test_clean_cycle_advances() {
        let outcome = FetchOutcome {
            succeeded: 3,
            failed: 0,
        };
        assert_eq!(next_cursor(Some(t(0)), t(300), outcome), Some(t(300)));
    }

    #[test]
    fn test_errored_cycle_keeps_existing_cursor() {
        let outcome = FetchOutcome {
            succeeded: 2,
            failed: 1,
        };
        assert_eq!(next_cursor(Some(t(0)), t(300), outcome), None);
    }

    #[test]
    fn test_errored_first_contact_still_initializes() {
        let outcome = FetchOutcome {
            succeeded: 2,
            failed: 1,
        };
        assert_eq!(next_cursor(None, t(300), outcome), Some(t(300)));
    }

    #[test]
    fn test_total_failure_on_first_contact_does_not_initialize() {
        let outcome = FetchOutcome {
            succeeded: 0,
            failed: 3,
        };
        assert_eq!(next_cursor(None, t(300), outcome), None);
    }

    #[test]
    fn test_record_counts_results() {
        let mut outcome = FetchOutcome::default();
        outcome.record::<(), &str>(&Ok(()));
        outcome.record::<(), &str>(&Err("boom"));
        outcome.record::<(), &str>(&Ok(()));
        assert_eq!(
            outcome,
            FetchOutcome {
                succeeded: 2,
                failed: 1
            }
        );
    }

    proptest! {
        #[test]
        fn prop_cursor_never_moves_backwards(
            prev in -10_000i64..10_000,
            started in -10_000i64..10_000,
            succeeded in 0usize..4,
            failed in 0usize..4,
        ) {
            let outcome = FetchOutcome { succeeded, failed };
            if let Some(next) = next_cursor(Some(t(prev)), t(started), outcome) {
                prop_assert!(next > t(prev));
            }
        }

        #[test]
        fn prop_window_always_overlaps_previous_cursor(cursor in -10_000i64..10_000) {
            let bound = lower_bound(Some(t(cursor)), None, t(20_000));
            prop_assert_eq!(t(cursor) - bound, Duration::seconds(CURSOR_OVERLAP_SECS));
        }
    }
}
