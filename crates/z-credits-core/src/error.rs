//! Error types for z-credits.

use crate::ids::IdError;

/// Result type for z-credits operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors surfaced by the credit ledger and proration engine.
///
/// Callers must be able to tell "nothing happened" (validation, not found,
/// conflict) apart from "money may have moved" (settlement). Wrapping layers
/// should preserve the variant rather than flatten it into a string.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A referenced entity (subscription, user, event) does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// Input rejected before any state was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Billing cycle geometry cannot be prorated.
    #[error("invalid billing cycle: {0}")]
    InvalidCycle(String),

    /// Transaction serialization kept failing after bounded retries.
    #[error("concurrent modification, gave up after {attempts} attempts")]
    Concurrency {
        /// Number of attempts made.
        attempts: u32,
    },

    /// External payment capture or credit issuance failed or timed out.
    #[error("settlement failed for proration event {event_id}: {message}")]
    Settlement {
        /// The proration event that was being settled.
        event_id: String,
        /// Gateway or timeout message.
        message: String,
    },

    /// Illegal state transition (e.g. reversing an event that is not applied).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator other than the payment gateway failed (e.g. the
    /// subscription directory could not be read).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Storage failure unrelated to contention.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl LedgerError {
    /// Create a `NotFound` error for the given entity kind.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the failure guarantees no ledger or payment state changed.
    #[must_use]
    pub const fn is_nothing_happened(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Validation(_)
                | Self::InvalidCycle(_)
                | Self::Conflict(_)
                | Self::InvalidId(_)
        )
    }

    /// True when an external money movement may have been attempted.
    #[must_use]
    pub const fn money_may_be_affected(&self) -> bool {
        matches!(self, Self::Settlement { .. })
    }

    /// True when the caller may safely retry the whole operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_is_never_classified_as_harmless() {
        let err = LedgerError::Settlement {
            event_id: "evt".into(),
            message: "card declined".into(),
        };
        assert!(err.money_may_be_affected());
        assert!(!err.is_nothing_happened());
    }

    #[test]
    fn validation_and_not_found_are_harmless() {
        assert!(LedgerError::Validation("amount".into()).is_nothing_happened());
        assert!(LedgerError::not_found("subscription", "abc").is_nothing_happened());
        assert!(LedgerError::Concurrency { attempts: 5 }.is_retryable());
    }

    #[test]
    fn not_found_message() {
        let err = LedgerError::not_found("subscription", "sub_1");
        assert_eq!(err.to_string(), "subscription not found: sub_1");
    }
}
