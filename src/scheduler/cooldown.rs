//! Minimum spacing between manually triggered measurements.
//!
//! Timer-driven runs never consult this; their interval floor is at least as
//! long as the cooldown.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CooldownDecision {
    Allowed,
    Denied { remaining_secs: u64 },
}

/// Decide whether a manual run may start at `now`.
///
/// A `last_attempt` in the future (clock stepped backwards) counts as zero
/// elapsed time, so the wait never exceeds one full period.
pub fn allowed(
    now: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
    period: Duration,
) -> CooldownDecision {
    let Some(last) = last_attempt else {
        return CooldownDecision::Allowed;
    };

    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    match period.checked_sub(elapsed) {
        Some(remaining) if !remaining.is_zero() => {
            // Round up: a caller told "0s" should not be denied again.
            let mut secs = remaining.as_secs();
            if remaining.subsec_nanos() > 0 {
                secs += 1;
            }
            CooldownDecision::Denied {
                remaining_secs: secs,
            }
        }
        _ => CooldownDecision::Allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const PERIOD: Duration = Duration::from_secs(300);

    #[test]
    fn test_never_run_is_allowed() {
        assert_eq!(allowed(Utc::now(), None, PERIOD), CooldownDecision::Allowed);
    }

    #[test]
    fn test_denied_reports_remaining() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(100);
        assert_eq!(
            allowed(now, Some(last), PERIOD),
            CooldownDecision::Denied {
                remaining_secs: 200
            }
        );
    }

    #[test]
    fn test_exactly_one_period_is_allowed() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(300);
        assert_eq!(allowed(now, Some(last), PERIOD), CooldownDecision::Allowed);

        let long_ago = now - ChronoDuration::days(3);
        assert_eq!(allowed(now, Some(long_ago), PERIOD), CooldownDecision::Allowed);
    }

    #[test]
    fn test_partial_second_rounds_up() {
        let now = Utc::now();
        let last = now - ChronoDuration::milliseconds(299_500);
        assert_eq!(
            allowed(now, Some(last), PERIOD),
            CooldownDecision::Denied { remaining_secs: 1 }
        );
    }

    #[test]
    fn test_clock_stepped_back_caps_at_period() {
        let now = Utc::now();
        let future = now + ChronoDuration::seconds(90);
        assert_eq!(
            allowed(now, Some(future), PERIOD),
            CooldownDecision::Denied {
                remaining_secs: 300
            }
        );
    }

    #[test]
    fn test_zero_period_always_allowed() {
        let now = Utc::now();
        assert_eq!(
            allowed(now, Some(now), Duration::ZERO),
            CooldownDecision::Allowed
        );
    }
}
