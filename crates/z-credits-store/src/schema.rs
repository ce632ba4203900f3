//! Column families of the ledger database.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Cached balance rows, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Append-only allocations, keyed by `user_id || allocation_id`.
    pub const ALLOCATIONS: &str = "allocations";

    /// Append-only deductions, keyed by `user_id || deduction_id`.
    pub const DEDUCTIONS: &str = "deductions";

    /// Proration events, keyed by `event_id` (ULID).
    pub const PRORATION_EVENTS: &str = "proration_events";

    /// Index: proration events by user, keyed by `user_id || event_id`.
    /// Value is empty (index only).
    pub const PRORATION_EVENTS_BY_USER: &str = "proration_events_by_user";

    /// Index: proration events by subscription, keyed by `subscription_id || event_id`.
    /// Value is empty (index only).
    pub const PRORATION_EVENTS_BY_SUBSCRIPTION: &str = "proration_events_by_subscription";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::ALLOCATIONS,
        cf::DEDUCTIONS,
        cf::PRORATION_EVENTS,
        cf::PRORATION_EVENTS_BY_USER,
        cf::PRORATION_EVENTS_BY_SUBSCRIPTION,
    ]
}
