//! Stripe integration for proration settlement.
//!
//! Stripe handles:
//! - Capturing positive net charges (off-session `PaymentIntent`s)
//! - Issuing credits owed on downgrades (customer balance transactions)
//!
//! Customers are found through the `user_id` metadata set when they were
//! registered with Stripe.

pub mod client;
pub mod types;

pub use client::{StripeError, StripeGateway};
pub use types::*;
