//! Per-entity persistent state carried between scheduler iterations.
//!
//! The serialized form is the sole iteration-to-iteration carrier: the
//! scheduler deserializes it on activation and hands the re-encoded blob to
//! the runtime's ContinueAsNew tail-call. Schema versioning is handled by
//! adding optional fields with documented defaults — every field here is
//! `#[serde(default)]` so older snapshots rehydrate cleanly.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::RequestMessage;

/// Scheduler state persisted between loop iterations.
///
/// Invariants maintained by the scheduler:
/// - `entity_state` is `Some` iff `entity_exists` is true
/// - `locked_by` is `Some` only between an admitted lock request and the
///   matching release
/// - `queue` preserves arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    #[serde(default)]
    pub entity_exists: bool,
    /// Opaque serialized user state; `None` while the entity does not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_state: Option<String>,
    /// Requests not yet admitted into a batch, in arrival order.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub queue: VecDeque<RequestMessage>,
    /// Instance id of the critical-section holder, if a lock is held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl SchedulerState {
    /// Rehydrate from the snapshot passed in via ContinueAsNew. A cold
    /// activation (no snapshot, or an empty one) yields the empty state.
    pub fn decode(snapshot: Option<&str>) -> Result<Self, String> {
        match snapshot {
            None => Ok(Self::default()),
            Some(s) if s.trim().is_empty() => Ok(Self::default()),
            Some(s) => serde_json::from_str(s).map_err(|e| format!("corrupt scheduler state: {e}")),
        }
    }

    /// Serialize for write-back. The output is deterministic for a given
    /// state value (field order is fixed, absent fields are omitted).
    pub fn encode(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("failed to serialize scheduler state: {e}"))
    }

    pub fn enqueue(&mut self, message: RequestMessage) {
        self.queue.push_back(message);
    }

    /// A latent entity with an empty queue and no held lock terminates its
    /// scheduler orchestration; anything else defers termination.
    pub fn can_terminate(&self) -> bool {
        !self.entity_exists && self.queue.is_empty() && self.locked_by.is_none()
    }

    /// `entity_state == None` iff `entity_exists == false`.
    pub fn is_coherent(&self) -> bool {
        self.entity_exists == self.entity_state.is_some()
    }
}
