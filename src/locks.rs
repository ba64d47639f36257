//! Multi-entity critical sections: the lock-chain protocol.
//!
//! A lock request carries an ordered `lock_set` and a `position` cursor. The
//! request travels entity to entity in the set's canonical order (class name,
//! then key); each scheduler records the holder, advances the cursor, and
//! forwards — the last one answers the requester. Because every overlapping
//! acquisition traverses shared entities in the same total order, chains can
//! never deadlock.

use tracing::debug;

use crate::runtime::OutboundMessage;
use crate::{EntityId, RequestMessage, ResponseMessage, RELEASE_OPERATION};

/// Sort by the canonical entity order and drop duplicates, producing a valid
/// `lock_set`.
pub fn normalize(mut lock_set: Vec<EntityId>) -> Vec<EntityId> {
    lock_set.sort();
    lock_set.dedup();
    lock_set
}

/// Whether `lock_set` is strictly ascending in the canonical order (sorted,
/// no duplicates).
pub fn is_canonical(lock_set: &[EntityId]) -> bool {
    lock_set.windows(2).all(|w| w[0] < w[1])
}

/// Routing sanity for an inbound lock request at entity `self_id`: the cursor
/// must be in range, must point at this entity, and the set must be in
/// canonical order. A lock request must also be an awaitable call: chains
/// complete with a response, so the signal flag is incompatible, and the
/// reserved release name must never double as an acquisition. Violations
/// mean the message was corrupted, misrouted, or crafted; the scheduler logs
/// and drops it rather than crash.
pub(crate) fn validate(self_id: &EntityId, request: &RequestMessage) -> Result<(), String> {
    if request.lock_set.is_empty() {
        return Err("lock request with empty lock set".to_string());
    }
    if request.is_signal {
        return Err("lock request marked as a signal".to_string());
    }
    if request.operation == RELEASE_OPERATION {
        return Err("lock request carrying the reserved release operation".to_string());
    }
    if !is_canonical(&request.lock_set) {
        return Err("lock set is not sorted and deduplicated".to_string());
    }
    let Some(expected) = request.lock_set.get(request.position) else {
        return Err(format!(
            "lock position {} out of range for lock set of {}",
            request.position,
            request.lock_set.len()
        ));
    };
    if expected != self_id {
        return Err(format!(
            "lock position {} addresses {expected} but was delivered to {self_id}",
            request.position
        ));
    }
    Ok(())
}

/// Process an admitted lock request: advance the cursor and either forward
/// the chain to the next entity or, at the end of the set, answer the
/// requester. `locked_by` was already set when the request was admitted as
/// the batch terminator.
///
/// The completion response's `result` is a human-readable diagnostic; callers
/// must not parse it.
pub(crate) fn advance(mut request: RequestMessage, outbox: &mut Vec<OutboundMessage>) {
    request.position += 1;
    if let Some(next) = request.lock_set.get(request.position).cloned() {
        debug!(
            target: "entoxide::locks",
            id = %request.id,
            parent_instance_id = %request.parent_instance_id,
            position = request.position,
            next = %next,
            "forwarding lock chain"
        );
        outbox.push(OutboundMessage::request(next.scheduler_id(), request));
    } else {
        debug!(
            target: "entoxide::locks",
            id = %request.id,
            parent_instance_id = %request.parent_instance_id,
            entities = request.lock_set.len(),
            "lock set fully acquired"
        );
        let response = ResponseMessage::success(Some(format!(
            "acquired locks for {} entities",
            request.lock_set.len()
        )));
        outbox.push(OutboundMessage::response(
            request.parent_instance_id,
            request.id,
            response,
        ));
    }
}
