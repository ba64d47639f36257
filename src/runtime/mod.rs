//! Abstractions the outer durable runtime must supply, and the message
//! envelopes the scheduler exchanges with it.
//!
//! The scheduler core never talks to storage or queues directly: it consumes
//! a [`Host`] for deterministic primitives and produces an outbox of
//! [`OutboundMessage`]s for the host to flush after the iteration's state
//! write-back commits. Under replay the outbox is reconstructed but must not
//! be resent — that discipline belongs to the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EntityId, EntityStatus, RequestMessage, ResponseMessage};

pub mod in_memory;

/// A message in flight between instances.
///
/// Entity schedulers receive only `Request` items; `Response` items are
/// routed to the `parent_instance_id` that issued the request, correlated by
/// the original request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntityMessage {
    Request {
        message: RequestMessage,
    },
    Response {
        correlation_id: String,
        message: ResponseMessage,
    },
}

/// An outbox entry: where to deliver, and what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Instance id of the recipient (an entity scheduler id for requests, a
    /// plain orchestration/client instance id for responses).
    pub target: String,
    pub message: EntityMessage,
}

impl OutboundMessage {
    pub(crate) fn request(target: impl Into<String>, message: RequestMessage) -> Self {
        Self {
            target: target.into(),
            message: EntityMessage::Request { message },
        }
    }

    pub(crate) fn response(
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        message: ResponseMessage,
    ) -> Self {
        Self {
            target: target.into(),
            message: EntityMessage::Response {
                correlation_id: correlation_id.into(),
                message,
            },
        }
    }
}

/// Deterministic runtime primitives available during a scheduler iteration.
///
/// Fresh ids and the current time are non-deterministic in the wild; a host
/// must source them so that replaying an iteration observes the same values
/// (history-backed in a real durable runtime, counter-backed in the
/// in-memory host).
#[async_trait]
pub trait Host: Send + Sync {
    /// A fresh globally unique id, deterministic under replay.
    fn new_guid(&self) -> String;

    /// Current time in milliseconds, deterministic under replay.
    fn now_ms(&self) -> u64;

    /// Invoke an activity through the underlying runtime. Activities are the
    /// escape hatch for real side effects; the runtime records their results
    /// so replay does not re-execute them.
    async fn call_activity(&self, name: &str, input: String) -> Result<String, String>;

    /// Observe a status snapshot. Called when an operation starts (with
    /// `current_operation` populated) and at iteration end (without). The
    /// default does nothing.
    fn publish_status(&self, entity: &EntityId, status: EntityStatus) {
        let _ = (entity, status);
    }
}

/// Transport surface the [`crate::Client`] drives: reliable enqueue toward an
/// instance, response pickup, and read access to persisted scheduler state.
#[async_trait]
pub trait EntityTransport: Send + Sync {
    /// Reliably enqueue a request toward an entity scheduler instance.
    async fn send_request(&self, target_instance: &str, message: RequestMessage)
        -> Result<(), String>;

    /// Take (and consume) the response correlated with `correlation_id` that
    /// was delivered to `parent_instance`, if it has arrived.
    async fn take_response(
        &self,
        parent_instance: &str,
        correlation_id: &str,
    ) -> Result<Option<ResponseMessage>, String>;

    /// Read the persisted scheduler state snapshot for an instance, if the
    /// instance exists.
    async fn read_state(&self, instance: &str) -> Result<Option<String>, String>;

    /// A fresh request id for client-issued messages.
    fn new_guid(&self) -> String;
}

/// Tunables for the scheduler loop.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Advisory cap on operations per batch. The cap never splits a batch's
    /// terminating lock request from the operations preceding it. `None`
    /// means unbounded.
    pub max_batch_operations: Option<usize>,
}
