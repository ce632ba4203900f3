//! Key encoding utilities for `RocksDB`.
//!
//! Composite keys are `owner (16 bytes) || record (16 bytes)`. Record IDs are
//! ULIDs, so a prefix scan over an owner yields records in creation order.

use z_credits_core::{
    AllocationId, DeductionId, ProrationEventId, SubscriptionId, UserId,
};

/// Length of a single encoded identifier.
pub const ID_LEN: usize = 16;

/// Create a balance key from a user ID.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create an allocation key.
#[must_use]
pub fn allocation_key(user_id: &UserId, allocation_id: &AllocationId) -> Vec<u8> {
    composite(user_id.as_bytes(), &allocation_id.to_bytes())
}

/// Create a deduction key.
#[must_use]
pub fn deduction_key(user_id: &UserId, deduction_id: &DeductionId) -> Vec<u8> {
    composite(user_id.as_bytes(), &deduction_id.to_bytes())
}

/// Create a proration event key.
#[must_use]
pub fn proration_event_key(event_id: &ProrationEventId) -> Vec<u8> {
    event_id.to_bytes().to_vec()
}

/// Create a user-event index key.
#[must_use]
pub fn user_event_key(user_id: &UserId, event_id: &ProrationEventId) -> Vec<u8> {
    composite(user_id.as_bytes(), &event_id.to_bytes())
}

/// Create a subscription-event index key.
#[must_use]
pub fn subscription_event_key(
    subscription_id: &SubscriptionId,
    event_id: &ProrationEventId,
) -> Vec<u8> {
    composite(subscription_id.as_bytes(), &event_id.to_bytes())
}

/// Create a prefix for iterating all records owned by a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a prefix for iterating all records owned by a subscription.
#[must_use]
pub fn subscription_prefix(subscription_id: &SubscriptionId) -> Vec<u8> {
    subscription_id.as_bytes().to_vec()
}

/// Extract the owning user from a user-prefixed key.
///
/// Returns `None` if the key is shorter than one identifier.
#[must_use]
pub fn extract_user_id(key: &[u8]) -> Option<UserId> {
    let bytes: [u8; ID_LEN] = key.get(..ID_LEN)?.try_into().ok()?;
    Some(UserId::from_bytes(bytes))
}

/// Extract the event ID from an index key (`owner || event_id`).
///
/// Returns `None` if the key is not exactly two identifiers long.
#[must_use]
pub fn extract_event_id(key: &[u8]) -> Option<ProrationEventId> {
    if key.len() != ID_LEN * 2 {
        return None;
    }
    let bytes: [u8; ID_LEN] = key[ID_LEN..].try_into().ok()?;
    Some(ProrationEventId::from_bytes(bytes))
}

fn composite(owner: &[u8; ID_LEN], record: &[u8; ID_LEN]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN * 2);
    key.extend_from_slice(owner);
    key.extend_from_slice(record);
    key
}
