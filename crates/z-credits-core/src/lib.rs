//! Core types and pure logic for z-credits.
//!
//! This crate provides the foundational types of the credit ledger and
//! proration engine:
//!
//! - **Identifiers**: `UserId`, `SubscriptionId`, `AllocationId`, `DeductionId`, `ProrationEventId`
//! - **Ledger facts**: `CreditAllocation`, `CreditDeduction`, `CreditBalance`
//! - **Subscriptions**: `Subscription`, `Tier`, `PriceBook`
//! - **Proration**: `compute_proration`, `ProrationCalculation`, `ProrationEvent`
//!
//! # Credit Unit
//!
//! **1 credit = $0.01 (1 cent)**
//!
//! Credits and money are both `i64` integer cents. Proration fractions are
//! resolved in one place, [`money::prorate_cents`], with round-half-up.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod credits;
pub mod error;
pub mod event;
pub mod ids;
pub mod money;
pub mod proration;
pub mod subscription;

pub use balance::{CreditBalance, Replay};
pub use credits::{AllocationSource, CreditAllocation, CreditDeduction};
pub use error::{LedgerError, Result};
pub use event::{ProrationEvent, ProrationStatus, SettlementKind};
pub use ids::{AllocationId, DeductionId, IdError, ProrationEventId, SubscriptionId, UserId};
pub use money::{format_usd, prorate_cents};
pub use proration::{compute_proration, ChangeRequest, ChangeType, ProrationCalculation};
pub use subscription::{BillingInterval, PriceBook, Subscription, SubscriptionStatus, Tier};
