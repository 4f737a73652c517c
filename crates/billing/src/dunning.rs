//! Dunning timeline evaluation
//!
//! Pure function of "days since the first payment failure in this cycle".
//! Day 0 is silent: Stripe's own smart retry runs the same day and sending
//! a notice there would double-contact the customer. Contact then escalates
//! before any hard restriction, and only day 7 moves the user out of
//! `past_due` into their grace window.

use kora_shared::AccessStatus;
use time::{Duration, OffsetDateTime};

/// Days of reduced access granted once dunning is exhausted.
pub const GRACE_PERIOD_DAYS: i64 = 7;

/// Day the reminder tone escalates from gentle to urgent.
pub const URGENT_AFTER_DAYS: i64 = 3;

/// Day dunning is exhausted and the grace period starts.
pub const FINAL_AFTER_DAYS: i64 = 7;

/// Escalation tier of a dunning notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunningTier {
    Gentle,
    Urgent,
    Final,
}

impl DunningTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningTier::Gentle => "gentle",
            DunningTier::Urgent => "urgent",
            DunningTier::Final => "final",
        }
    }
}

impl std::fmt::Display for DunningTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of evaluating the dunning timeline at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DunningDecision {
    pub status: AccessStatus,
    /// None means stay silent (processor retry window).
    pub notification: Option<DunningTier>,
}

/// Evaluate the dunning timeline.
///
/// Negative inputs are clamped to day 0 (clock skew between Stripe's event
/// timestamps and the stored first-failure time).
pub fn evaluate(days_since_first_failure: i64) -> DunningDecision {
    let days = days_since_first_failure.max(0);

    if days == 0 {
        DunningDecision {
            status: AccessStatus::PastDue,
            notification: None,
        }
    } else if days < URGENT_AFTER_DAYS {
        DunningDecision {
            status: AccessStatus::PastDue,
            notification: Some(DunningTier::Gentle),
        }
    } else if days < FINAL_AFTER_DAYS {
        DunningDecision {
            status: AccessStatus::PastDue,
            notification: Some(DunningTier::Urgent),
        }
    } else {
        DunningDecision {
            status: AccessStatus::GracePeriod,
            notification: Some(DunningTier::Final),
        }
    }
}

/// Grace deadline for a user entering their grace period now.
pub fn grace_deadline(now: OffsetDateTime) -> OffsetDateTime {
    now + Duration::days(GRACE_PERIOD_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn day_zero_is_silent() {
        let decision = evaluate(0);
        assert_eq!(decision.status, AccessStatus::PastDue);
        assert_eq!(decision.notification, None);
    }

    #[test]
    fn escalation_timeline() {
        // T0 + 1 day: gentle reminder
        let d1 = evaluate(1);
        assert_eq!(d1.status, AccessStatus::PastDue);
        assert_eq!(d1.notification, Some(DunningTier::Gentle));

        // T0 + 4 days: urgent reminder
        let d4 = evaluate(4);
        assert_eq!(d4.status, AccessStatus::PastDue);
        assert_eq!(d4.notification, Some(DunningTier::Urgent));

        // T0 + 8 days: final notice, grace period starts
        let d8 = evaluate(8);
        assert_eq!(d8.status, AccessStatus::GracePeriod);
        assert_eq!(d8.notification, Some(DunningTier::Final));
    }

    #[test]
    fn boundaries() {
        assert_eq!(evaluate(2).notification, Some(DunningTier::Gentle));
        assert_eq!(evaluate(3).notification, Some(DunningTier::Urgent));
        assert_eq!(evaluate(6).notification, Some(DunningTier::Urgent));
        assert_eq!(evaluate(7).status, AccessStatus::GracePeriod);
        assert_eq!(evaluate(7).notification, Some(DunningTier::Final));
    }

    #[test]
    fn status_is_monotonic_in_days() {
        // Once the timeline reaches grace_period it never goes back for any
        // larger input.
        let mut reached_grace = false;
        for days in 0..30 {
            let decision = evaluate(days);
            if reached_grace {
                assert_eq!(decision.status, AccessStatus::GracePeriod);
            }
            if decision.status == AccessStatus::GracePeriod {
                reached_grace = true;
            }
        }
        assert!(reached_grace);
    }

    #[test]
    fn negative_days_clamp_to_silent() {
        let decision = evaluate(-3);
        assert_eq!(decision.status, AccessStatus::PastDue);
        assert_eq!(decision.notification, None);
    }

    #[test]
    fn grace_deadline_is_seven_days_out() {
        let now = datetime!(2025-03-01 12:00 UTC);
        assert_eq!(grace_deadline(now), datetime!(2025-03-08 12:00 UTC));
    }
}
