// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests across the dunning state machine
//!
//! Boundary conditions that span modules: the dunning timeline against the
//! access policy, notification tier mapping, and the transition relation
//! under replayed or late events.

#[cfg(test)]
mod dunning_policy_tests {
    use crate::dunning::{self, DunningTier};
    use kora_shared::{policy_for, AccessStatus};

    // A user walking the whole dunning timeline: access narrows exactly when
    // the status narrows, never earlier.
    #[test]
    fn access_follows_the_dunning_timeline() {
        // Day 0 through 6: past_due. Chat is already off for past_due.
        for day in 0..7 {
            let decision = dunning::evaluate(day);
            assert_eq!(decision.status, AccessStatus::PastDue, "day {day}");
            let policy = policy_for(decision.status);
            assert!(!policy.chat_enabled, "day {day}");
        }

        // Day 7 onward: grace period restores reduced access before the
        // sweeper takes it away for good.
        for day in 7..21 {
            let decision = dunning::evaluate(day);
            assert_eq!(decision.status, AccessStatus::GracePeriod, "day {day}");
            let policy = policy_for(decision.status);
            assert!(policy.chat_enabled, "day {day}");
            assert!(policy.daily_message_quota > 0, "day {day}");
        }
    }

    #[test]
    fn notification_tiers_escalate_and_never_deescalate() {
        let mut highest = 0u8;
        let rank = |tier: Option<DunningTier>| match tier {
            None => 0u8,
            Some(DunningTier::Gentle) => 1,
            Some(DunningTier::Urgent) => 2,
            Some(DunningTier::Final) => 3,
        };
        for day in 0..30 {
            let tier_rank = rank(dunning::evaluate(day).notification);
            assert!(
                tier_rank >= highest,
                "notification tier de-escalated on day {day}"
            );
            highest = tier_rank;
        }
        assert_eq!(highest, 3);
    }

    #[test]
    fn evaluation_is_a_pure_function_of_days() {
        for day in [0, 1, 3, 6, 7, 30] {
            assert_eq!(dunning::evaluate(day), dunning::evaluate(day));
        }
    }
}

#[cfg(test)]
mod transition_replay_tests {
    use kora_shared::{can_transition, AccessStatus};

    // Replaying the sweeper or a webhook must be able to re-apply the state
    // it already applied.
    #[test]
    fn replay_of_terminal_writes_is_legal() {
        assert!(can_transition(
            AccessStatus::Suspended,
            AccessStatus::Suspended
        ));
        assert!(can_transition(AccessStatus::Premium, AccessStatus::Premium));
        assert!(can_transition(AccessStatus::Free, AccessStatus::Free));
    }

    // The recovery paths out of dunning, in both directions the processor
    // can report them.
    #[test]
    fn recovery_paths_exist_from_every_dunning_state() {
        assert!(can_transition(AccessStatus::PastDue, AccessStatus::Premium));
        assert!(can_transition(
            AccessStatus::GracePeriod,
            AccessStatus::Premium
        ));
        // ...but not from suspension, which requires an admin.
        assert!(!can_transition(
            AccessStatus::Suspended,
            AccessStatus::Premium
        ));
    }

    // Subscription deletion downgrades from any live paid state.
    #[test]
    fn deletion_downgrades_all_live_states() {
        for from in [
            AccessStatus::Premium,
            AccessStatus::PastDue,
            AccessStatus::GracePeriod,
        ] {
            assert!(can_transition(from, AccessStatus::Free), "{from}");
        }
    }
}

#[cfg(test)]
mod notification_mapping_tests {
    use crate::dunning::{self, DunningTier};
    use crate::notify::{render, NotificationKind, TemplateData};

    fn kind_for(tier: DunningTier) -> NotificationKind {
        match tier {
            DunningTier::Gentle => NotificationKind::DunningGentle,
            DunningTier::Urgent => NotificationKind::DunningUrgent,
            DunningTier::Final => NotificationKind::DunningFinal,
        }
    }

    // Every tier the evaluator can produce has a template, and day 0
    // produces none.
    #[test]
    fn every_dunning_tier_resolves_to_a_template() {
        assert_eq!(dunning::evaluate(0).notification, None);

        let data = TemplateData {
            display_name: "Sam".to_string(),
            billing_url: "https://app.kora.test/settings/billing".to_string(),
            grace_ends_on: Some("June 2".to_string()),
            access_ends_on: None,
        };

        for day in [1, 4, 8] {
            let tier = dunning::evaluate(day).notification.unwrap();
            let rendered = render(kind_for(tier), &data);
            assert!(!rendered.subject.is_empty(), "day {day}");
            assert!(rendered.body_html.contains("Sam"), "day {day}");
        }
    }
}
