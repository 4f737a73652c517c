#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kora shared types
//!
//! Leaf crate shared by the API server, the billing crate, and the worker:
//! access statuses and the status -> capability policy, subscription tiers,
//! and database pool/migration helpers.

pub mod access;
pub mod db;

pub use access::{
    can_transition, policy_for, AccessPolicy, AccessStatus, ApprovalType, PaymentStatus,
    SubscriptionTier, GRACE_DAILY_QUOTA, PREMIUM_DAILY_QUOTA,
};
pub use db::{create_migration_pool, create_pool, run_migrations};
