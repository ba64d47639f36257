//! # Entoxide: durable entities for Rust
//!
//! Entoxide implements an "actor-like" extension on top of a generic durable
//! orchestration runtime: addressable, long-lived objects with private state,
//! identified by `(class name, key)`. Clients and orchestrations send an
//! entity operations and optionally await responses. The scheduler guarantees
//! that operations on one entity execute one at a time in delivery order,
//! that state mutations are durable across failures, and that distributed
//! critical sections spanning multiple entities are acquired in a
//! deadlock-free order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entoxide::{Client, EntityClass, EntityContext, EntityId, EntityRegistry, InMemoryHost};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Describe an entity class: name -> operation handlers
//! let counter = EntityClass::builder("Counter")
//!     .operation("add", |ctx: EntityContext, amount: i64| async move {
//!         let value: i64 = ctx.get_state()?;
//!         ctx.set_state(&(value + amount))
//!     })
//!     .operation("get", |ctx: EntityContext, _: ()| async move {
//!         let value: i64 = ctx.get_state()?;
//!         ctx.return_value(&value)
//!     })
//!     .build();
//!
//! // 2. Register it and start an in-process host
//! let registry = EntityRegistry::builder().register(counter).build();
//! let host = InMemoryHost::builder().registry(registry).build();
//!
//! // 3. Drive the entity from a client
//! let client = Client::new(host.clone());
//! let id = EntityId::new("Counter", "c1");
//! client.signal_entity(&id, "add", Some("5".into())).await?;
//! let value = client
//!     .call_entity(&id, "get", None, Duration::from_secs(5))
//!     .await?;
//! assert_eq!(value.as_deref(), Some("5"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Entity**: addressable, state-bearing object identified by
//!   [`EntityId`]. Latent until the first operation touches it; deleted via
//!   [`EntityContext::destruct_on_exit`].
//! - **Operation**: a request/response interaction. **Signal**: fire-and-forget,
//!   no response is ever delivered.
//! - **Scheduler**: the per-entity looping orchestration
//!   ([`EntityScheduler`]) that serializes operations. One iteration per
//!   activation: rehydrate state, ingest delivered messages, execute a batch,
//!   flush the outbox, carry state to the next iteration via the runtime's
//!   ContinueAsNew tail-call.
//! - **Lock request**: a message that traverses an ordered lock set acquiring
//!   exclusive access to several entities at once. The set is globally
//!   ordered (class name, then key), which makes overlapping acquisitions
//!   deadlock-free.
//! - **Outbox**: the per-iteration buffer of outbound messages, flushed
//!   atomically with state write-back so replay never re-sends.
//!
//! ## Architecture
//!
//! The crate provides the scheduler core plus the seams it plugs into:
//!
//! - Wire and persistence types: [`RequestMessage`], [`ResponseMessage`],
//!   [`SchedulerState`]
//! - [`EntityRegistry`]: `class name -> (operation name -> handler)`
//! - [`EntityContext`]: the surface lent to user handlers for one operation
//! - [`EntityScheduler`]: the replayable per-entity iteration driver
//! - [`runtime`]: the abstractions the outer durable runtime must supply
//!   ([`Host`], [`EntityTransport`]) and an in-process implementation
//!   ([`InMemoryHost`]) suitable for tests and embedded use
//! - [`Client`]: signal / call / status / multi-entity critical sections
//!
//! The underlying durable-workflow runtime (history replay, reliable
//! messaging, activity dispatch) is an external collaborator; this crate only
//! depends on its abstractions.

use serde::{Deserialize, Serialize};

pub mod batch;
pub mod client;
pub mod context;
pub mod dispatch;
pub mod locks;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod status;

pub use client::{Client, ClientError, CriticalSection};
pub use context::EntityContext;
pub use dispatch::{BatchInvoker, BatchWorkRequest, BatchWorkResult, DispatchMode};
pub use registry::{EntityClass, EntityClassBuilder, EntityRegistry, EntityRegistryBuilder, OperationError};
pub use runtime::in_memory::{InMemoryHost, InMemoryHostBuilder};
pub use runtime::{EntityMessage, EntityTransport, Host, OutboundMessage, SchedulerOptions};
pub use scheduler::{EntityScheduler, IterationDecision, IterationResult, SchedulerError};
pub use state::SchedulerState;
pub use status::{CurrentOperation, EntityStatus};

/// Reserved operation name that releases a critical section held on the
/// receiving entity. Always treated as a signal: the scheduler clears
/// `locked_by` atomically with the batch write-back and never delivers a
/// response for it.
pub const RELEASE_OPERATION: &str = "__release";

/// Operation name stamped on lock-request messages. Lock requests are
/// recognized by a non-empty `lock_set`, not by this name; it exists so logs
/// and status snapshots have something readable to show.
pub const ACQUIRE_OPERATION: &str = "__acquire";

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return raw content to preserve historic behavior
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            // Try parse as JSON first
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Address of an entity: class name plus key. Equality is componentwise.
///
/// `EntityId` carries the total order used by the lock protocol: lexicographic
/// on `class_name`, then `key` (the derived `Ord` — field order matters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityId {
    pub class_name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(class_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            key: key.into(),
        }
    }

    /// The scheduler instance id used as this entity's routing address within
    /// the underlying workflow runtime: `@{class_name}@{key}`.
    ///
    /// The encoding round-trips through [`EntityId::from_scheduler_id`]. The
    /// class name must not contain `@` (the key may).
    pub fn scheduler_id(&self) -> String {
        format!("@{}@{}", self.class_name, self.key)
    }

    /// Decode a scheduler instance id produced by [`EntityId::scheduler_id`].
    pub fn from_scheduler_id(instance_id: &str) -> Result<Self, String> {
        let rest = instance_id
            .strip_prefix('@')
            .ok_or_else(|| format!("not an entity scheduler id: {instance_id}"))?;
        match rest.split_once('@') {
            Some((class_name, key)) if !class_name.is_empty() => Ok(Self {
                class_name: class_name.to_string(),
                key: key.to_string(),
            }),
            _ => Err(format!("not an entity scheduler id: {instance_id}")),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}@{}", self.class_name, self.key)
    }
}

/// A message delivered to an entity scheduler: an operation, a signal, or a
/// lock request.
///
/// A message is a **lock request** iff `lock_set` is non-empty; `position` is
/// the zero-based cursor into `lock_set` identifying the entity currently
/// processing the chain. For plain operations and signals both fields are at
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    /// Globally unique request identifier; responses correlate on it.
    pub id: String,
    /// The orchestration (or client-proxy instance) that issued the request;
    /// the reply target.
    pub parent_instance_id: String,
    /// Logical operation name.
    pub operation: String,
    /// Opaque serialized argument payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Signals are fire-and-forget: no response is sent.
    #[serde(default)]
    pub is_signal: bool,
    /// Ordered list of entities to be locked; empty for plain operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lock_set: Vec<EntityId>,
    /// Zero-based cursor into `lock_set`.
    #[serde(default)]
    pub position: usize,
}

impl RequestMessage {
    /// Build a plain operation request.
    pub fn operation(
        id: impl Into<String>,
        parent_instance_id: impl Into<String>,
        operation: impl Into<String>,
        input: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_instance_id: parent_instance_id.into(),
            operation: operation.into(),
            input,
            is_signal: false,
            lock_set: Vec::new(),
            position: 0,
        }
    }

    /// Build a fire-and-forget signal.
    pub fn signal(
        id: impl Into<String>,
        parent_instance_id: impl Into<String>,
        operation: impl Into<String>,
        input: Option<String>,
    ) -> Self {
        let mut msg = Self::operation(id, parent_instance_id, operation, input);
        msg.is_signal = true;
        msg
    }

    /// Build a lock request over `lock_set`. The set is normalized (sorted by
    /// the canonical entity order, deduplicated) and the cursor starts at 0;
    /// send the result to `lock_set[0]`'s scheduler.
    pub fn lock(
        id: impl Into<String>,
        parent_instance_id: impl Into<String>,
        lock_set: Vec<EntityId>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_instance_id: parent_instance_id.into(),
            operation: ACQUIRE_OPERATION.to_string(),
            input: None,
            is_signal: false,
            lock_set: locks::normalize(lock_set),
            position: 0,
        }
    }

    /// Whether this message is a lock request (non-empty `lock_set`).
    pub fn is_lock_request(&self) -> bool {
        !self.lock_set.is_empty()
    }
}

/// Stable failure classification carried on the wire as `exceptionType`.
///
/// The free-form message travels separately in `exceptionDetails`; callers
/// should branch on the kind and treat the details as diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The user operation raised.
    OperationFailed,
    /// No handler registered for the operation name.
    OperationNotFound,
    /// No entity class registered under the class name.
    ClassNotFound,
    /// Inbound input or outbound result failed to (de)serialize.
    SerializationFailed,
    /// The message violated a scheduler invariant and was dropped.
    ProtocolViolation,
    /// The out-of-process worker returned an unusable batch result.
    OutOfProcessFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::OperationFailed => "OperationFailed",
            FailureKind::OperationNotFound => "OperationNotFound",
            FailureKind::ClassNotFound => "ClassNotFound",
            FailureKind::SerializationFailed => "SerializationFailed",
            FailureKind::ProtocolViolation => "ProtocolViolation",
            FailureKind::OutOfProcessFailure => "OutOfProcessFailure",
        };
        write!(f, "{s}")
    }
}

/// Kind plus diagnostic message for a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub kind: FailureKind,
    pub details: String,
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.details)
    }
}

/// Reply to a non-signal request. Exactly one of `result` or
/// (`exception_type` + `exception_details`) is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<String>,
}

impl ResponseMessage {
    pub fn success(result: Option<String>) -> Self {
        Self {
            result,
            exception_type: None,
            exception_details: None,
        }
    }

    pub fn failure(kind: FailureKind, details: impl Into<String>) -> Self {
        Self {
            result: None,
            exception_type: Some(kind),
            exception_details: Some(details.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.exception_type.is_some()
    }

    /// Extract the failure, if any.
    pub fn failure_details(&self) -> Option<FailureDetails> {
        self.exception_type.map(|kind| FailureDetails {
            kind,
            details: self.exception_details.clone().unwrap_or_default(),
        })
    }
}
