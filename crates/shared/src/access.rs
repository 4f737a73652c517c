//! Access statuses and the status -> capability policy
//!
//! This is the single source of truth for what a user in a given billing
//! state is allowed to do. Both the webhook-driven status synchronizer and
//! the API-side guards consult it; neither encodes quotas of its own.

use serde::{Deserialize, Serialize};

/// Daily message quota for premium users.
pub const PREMIUM_DAILY_QUOTA: i32 = 50;

/// Reduced daily message quota while a user is in their grace period.
pub const GRACE_DAILY_QUOTA: i32 = 10;

/// Access-control status of a user. Drives the access policy.
///
/// Stored as TEXT in the `users.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Free,
    Premium,
    PastDue,
    GracePeriod,
    Suspended,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Free => "free",
            AccessStatus::Premium => "premium",
            AccessStatus::PastDue => "past_due",
            AccessStatus::GracePeriod => "grace_period",
            AccessStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(AccessStatus::Free),
            "premium" => Some(AccessStatus::Premium),
            "past_due" => Some(AccessStatus::PastDue),
            "grace_period" => Some(AccessStatus::GracePeriod),
            "suspended" => Some(AccessStatus::Suspended),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mirror of the payment processor's subscription status.
///
/// Stored as TEXT in the `users.payment_status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Active => "active",
            PaymentStatus::PastDue => "past_due",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PaymentStatus::Active),
            "past_due" => Some(PaymentStatus::PastDue),
            "canceled" => Some(PaymentStatus::Canceled),
            "incomplete" => Some(PaymentStatus::Incomplete),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance of the user's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Pending,
    Stripe,
    Admin,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalType::Pending => "pending",
            ApprovalType::Stripe => "stripe",
            ApprovalType::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalType::Pending),
            "stripe" => Some(ApprovalType::Stripe),
            "admin" => Some(ApprovalType::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(SubscriptionTier::Free),
            "premium" => Some(SubscriptionTier::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability set derived from an access status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Whether the chat coach is available at all.
    pub chat_enabled: bool,
    /// Whether premium content (guided programs, long-form sessions) is
    /// unlocked.
    pub premium_content: bool,
    /// Daily chat message quota. Zero means no messages.
    pub daily_message_quota: i32,
}

/// Pure mapping from status to capabilities.
pub fn policy_for(status: AccessStatus) -> AccessPolicy {
    match status {
        AccessStatus::Premium => AccessPolicy {
            chat_enabled: true,
            premium_content: true,
            daily_message_quota: PREMIUM_DAILY_QUOTA,
        },
        // Reduced-but-nonzero access while dunning is exhausted and the
        // grace window runs down.
        AccessStatus::GracePeriod => AccessPolicy {
            chat_enabled: true,
            premium_content: false,
            daily_message_quota: GRACE_DAILY_QUOTA,
        },
        AccessStatus::Free | AccessStatus::PastDue | AccessStatus::Suspended => AccessPolicy {
            chat_enabled: false,
            premium_content: false,
            daily_message_quota: 0,
        },
    }
}

/// Legal status transitions.
///
/// Same-state writes are always legal: the synchronizer is idempotent by
/// value, and the sweeper may re-apply `suspended` on overlapping runs.
///
/// - free -> premium: subscription created/activated
/// - premium <-> past_due: payment fails / recovers
/// - past_due -> grace_period: dunning day >= 7
/// - grace_period -> premium: payment recovers
/// - grace_period -> suspended: grace window elapses
/// - suspended -> free: manual admin reactivation only
/// - premium | past_due | grace_period -> free: subscription deleted
pub fn can_transition(from: AccessStatus, to: AccessStatus) -> bool {
    use AccessStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Free, Premium)
            | (Premium, PastDue)
            | (PastDue, Premium)
            | (PastDue, GracePeriod)
            | (GracePeriod, Premium)
            | (GracePeriod, Suspended)
            | (Suspended, Free)
            | (Premium, Free)
            | (PastDue, Free)
            | (GracePeriod, Free)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premium_policy_unlocks_chat_and_content() {
        let policy = policy_for(AccessStatus::Premium);
        assert!(policy.chat_enabled);
        assert!(policy.premium_content);
        assert_eq!(policy.daily_message_quota, PREMIUM_DAILY_QUOTA);
    }

    #[test]
    fn grace_period_keeps_reduced_chat_access() {
        let policy = policy_for(AccessStatus::GracePeriod);
        assert!(policy.chat_enabled);
        assert!(!policy.premium_content);
        assert_eq!(policy.daily_message_quota, GRACE_DAILY_QUOTA);
        assert!(policy.daily_message_quota < PREMIUM_DAILY_QUOTA);
    }

    #[test]
    fn non_paying_statuses_have_zero_quota() {
        for status in [
            AccessStatus::Free,
            AccessStatus::PastDue,
            AccessStatus::Suspended,
        ] {
            let policy = policy_for(status);
            assert!(!policy.chat_enabled, "{status} should not have chat");
            assert_eq!(policy.daily_message_quota, 0);
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            AccessStatus::Free,
            AccessStatus::Premium,
            AccessStatus::PastDue,
            AccessStatus::GracePeriod,
            AccessStatus::Suspended,
        ] {
            assert_eq!(AccessStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AccessStatus::parse("deleted"), None);
    }

    #[test]
    fn lifecycle_transitions_are_legal() {
        use AccessStatus::*;
        assert!(can_transition(Free, Premium));
        assert!(can_transition(Premium, PastDue));
        assert!(can_transition(PastDue, Premium));
        assert!(can_transition(PastDue, GracePeriod));
        assert!(can_transition(GracePeriod, Premium));
        assert!(can_transition(GracePeriod, Suspended));
        assert!(can_transition(Suspended, Free));
        assert!(can_transition(GracePeriod, Free));
    }

    #[test]
    fn suspended_has_no_automatic_exit() {
        use AccessStatus::*;
        assert!(!can_transition(Suspended, Premium));
        assert!(!can_transition(Suspended, PastDue));
        assert!(!can_transition(Suspended, GracePeriod));
    }

    #[test]
    fn same_state_writes_are_idempotent() {
        use AccessStatus::*;
        for status in [Free, Premium, PastDue, GracePeriod, Suspended] {
            assert!(can_transition(status, status));
        }
    }

    #[test]
    fn free_cannot_skip_ahead() {
        use AccessStatus::*;
        assert!(!can_transition(Free, PastDue));
        assert!(!can_transition(Free, GracePeriod));
        assert!(!can_transition(Free, Suspended));
        assert!(!can_transition(Premium, GracePeriod));
        assert!(!can_transition(Premium, Suspended));
    }
}
