//! Batch assembly: the unit of work executed per scheduler iteration.
//!
//! A batch is a (possibly empty) sequence of operations and signals followed
//! by at most one lock request. Messages are consumed in queue order; while a
//! lock is held, messages from other senders stay queued in place and are
//! skipped over so the holder can keep driving the entity. A lock request is
//! the one thing never skipped: it either terminates the batch or, when it
//! belongs to a blocked sender, stops assembly cold so it cannot be starved
//! by later traffic.

use std::collections::VecDeque;

use tracing::debug;

use crate::state::SchedulerState;
use crate::RequestMessage;

/// One iteration's worth of admitted work.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Operations and signals, in arrival order.
    pub operations: Vec<RequestMessage>,
    /// The terminating lock request, if one was admitted.
    pub lock_request: Option<RequestMessage>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.lock_request.is_none()
    }

    pub fn len(&self) -> usize {
        self.operations.len() + usize::from(self.lock_request.is_some())
    }
}

/// Whether the queue holds anything a batch could admit right now. Used by
/// hosts to decide if a parked scheduler needs another activation.
pub(crate) fn has_eligible_work(state: &SchedulerState) -> bool {
    let mut probe = state.clone();
    !build_batch(&mut probe, None).is_empty()
}

/// Consume eligible messages from `state.queue` into a batch:
///
/// - no lock held: operations and signals from any sender are admitted, in
///   queue order
/// - lock held by `P`: only messages with `parent_instance_id == P` are
///   admitted; others stay queued in place (relative order preserved)
/// - a lock request terminates the batch; when admitted fresh, `locked_by`
///   is set immediately so the lock holds even before the batch commits. A
///   lock request from the current holder is a re-entrant no-op ack and also
///   terminates the batch. A lock request from a blocked sender stops
///   assembly: it is never skipped over, even to reach eligible messages
///   behind it
///
/// `limit` is advisory: once the operation count reaches it, assembly stops —
/// except that a lock request encountered at the stopping point is still
/// admitted, so the terminator is never split from the operations before it.
pub fn build_batch(state: &mut SchedulerState, limit: Option<usize>) -> Batch {
    let mut batch = Batch::default();
    let mut queue = std::mem::take(&mut state.queue);
    let mut remaining: VecDeque<RequestMessage> = VecDeque::new();
    let mut stopped = false;

    while let Some(message) = queue.pop_front() {
        if stopped {
            remaining.push_back(message);
            continue;
        }
        let eligible = match &state.locked_by {
            None => true,
            Some(holder) => message.parent_instance_id == *holder,
        };
        if message.is_lock_request() {
            if eligible {
                if state.locked_by.is_none() {
                    state.locked_by = Some(message.parent_instance_id.clone());
                }
                batch.lock_request = Some(message);
            } else {
                // A blocked lock request is a barrier, not a skip.
                remaining.push_back(message);
            }
            stopped = true;
            continue;
        }
        if !eligible {
            remaining.push_back(message);
            continue;
        }
        if limit.is_some_and(|n| batch.operations.len() >= n) {
            remaining.push_back(message);
            stopped = true;
            continue;
        }
        batch.operations.push(message);
    }

    state.queue = remaining;
    if !batch.is_empty() {
        debug!(
            target: "entoxide::batch",
            operations = batch.operations.len(),
            has_lock_request = batch.lock_request.is_some(),
            remaining = state.queue.len(),
            "assembled batch"
        );
    }
    batch
}
