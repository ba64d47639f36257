//! In-process host: a deterministic, single-process implementation of the
//! runtime abstractions, suitable for tests and embedded use.
//!
//! One mailbox and one state slot per scheduler instance, all behind a single
//! async mutex. The pump activates one instance at a time — per-entity
//! serialization comes for free — and routes each iteration's outbox after
//! its state write-back, mirroring the commit-then-send discipline of a real
//! durable runtime. Ids and time come from counters so a given message
//! sequence always produces the same wire traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::batch;
use crate::dispatch::DispatchMode;
use crate::registry::EntityRegistry;
use crate::runtime::{EntityMessage, EntityTransport, Host, SchedulerOptions};
use crate::scheduler::{EntityScheduler, IterationDecision};
use crate::state::SchedulerState;
use crate::status::EntityStatus;
use crate::{EntityId, RequestMessage, ResponseMessage};

/// Arbitrary fixed epoch for the logical clock (keeps timestamps plausible
/// without consulting the wall clock).
const LOGICAL_EPOCH_MS: u64 = 1_690_000_000_000;

type ActivityFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

#[derive(Default)]
struct HostInner {
    /// Persisted scheduler state per instance. BTreeMap so the pump scans in
    /// a stable order.
    states: BTreeMap<String, String>,
    /// Messages delivered but not yet handed to an activation.
    mailboxes: BTreeMap<String, Vec<RequestMessage>>,
    /// Responses routed to non-entity instances, keyed by correlation id.
    responses: HashMap<String, HashMap<String, ResponseMessage>>,
}

/// Single-process entity host.
pub struct InMemoryHost {
    mode: DispatchMode,
    options: SchedulerOptions,
    activities: HashMap<String, ActivityFn>,
    inner: Mutex<HostInner>,
    /// Serializes pump runs: concurrent senders must not activate the same
    /// instance twice.
    pump_gate: Mutex<()>,
    statuses: std::sync::Mutex<HashMap<String, EntityStatus>>,
    guid_counter: AtomicU64,
    clock_ticks: AtomicU64,
    self_ref: Weak<InMemoryHost>,
}

impl InMemoryHost {
    pub fn builder() -> InMemoryHostBuilder {
        InMemoryHostBuilder {
            mode: None,
            options: SchedulerOptions::default(),
            activities: HashMap::new(),
        }
    }

    fn host_arc(&self) -> Arc<dyn Host> {
        // A live &self implies at least one strong reference.
        self.self_ref.upgrade().expect("host already dropped")
    }

    /// Process activations until no instance has deliverable or eligible
    /// work. Called automatically after every `send_request`.
    pub async fn pump(&self) -> Result<(), String> {
        let _gate = self.pump_gate.lock().await;
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                let Some(instance) = Self::next_runnable(&inner) else {
                    break;
                };
                let inbound = inner.mailboxes.remove(&instance).unwrap_or_default();
                let snapshot = inner.states.get(&instance).cloned();
                (instance, snapshot, inbound)
            };
            self.activate(next.0, next.1, next.2).await?;
        }
        Ok(())
    }

    /// An instance is runnable when messages await delivery, when its carried
    /// queue holds admissible work (e.g. unblocked by a release), or when it
    /// is ready to terminate.
    fn next_runnable(inner: &HostInner) -> Option<String> {
        if let Some((instance, _)) = inner.mailboxes.iter().find(|(_, v)| !v.is_empty()) {
            return Some(instance.clone());
        }
        for (instance, snapshot) in &inner.states {
            match SchedulerState::decode(Some(snapshot)) {
                Ok(state) if batch::has_eligible_work(&state) || state.can_terminate() => {
                    return Some(instance.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        target: "entoxide::host",
                        instance_id = %instance,
                        "skipping instance with corrupt state: {e}"
                    );
                }
            }
        }
        None
    }

    async fn activate(
        &self,
        instance: String,
        snapshot: Option<String>,
        inbound: Vec<RequestMessage>,
    ) -> Result<(), String> {
        let entity_id = EntityId::from_scheduler_id(&instance)?;
        let scheduler = EntityScheduler::with_options(
            entity_id,
            self.mode.clone(),
            self.host_arc(),
            self.options.clone(),
        );
        let result = scheduler
            .execute_iteration(snapshot.as_deref(), inbound, false)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(failure) = &result.failure {
            // First user failure of the iteration, traced as a runtime
            // failure; the caller already has it in their response.
            warn!(
                target: "entoxide::host",
                instance_id = %instance,
                "iteration recorded failure: {failure}"
            );
        }

        let mut inner = self.inner.lock().await;
        match result.decision {
            IterationDecision::ContinueAsNew { state } => {
                inner.states.insert(instance.clone(), state);
            }
            IterationDecision::Terminate => {
                debug!(target: "entoxide::host", instance_id = %instance, "scheduler terminated");
                inner.states.remove(&instance);
                self.statuses
                    .lock()
                    .expect("status mutex poisoned")
                    .remove(&instance);
            }
        }
        // Outbox flush happens strictly after the state commit above.
        for out in result.outbox {
            match out.message {
                EntityMessage::Request { message } => {
                    inner.mailboxes.entry(out.target).or_default().push(message);
                }
                EntityMessage::Response {
                    correlation_id,
                    message,
                } => {
                    inner
                        .responses
                        .entry(out.target)
                        .or_default()
                        .insert(correlation_id, message);
                }
            }
        }
        Ok(())
    }

    // === Diagnostics ===

    /// The persisted scheduler state for an entity, if its instance is alive.
    pub async fn read_state_snapshot(&self, entity: &EntityId) -> Option<String> {
        self.inner
            .lock()
            .await
            .states
            .get(&entity.scheduler_id())
            .cloned()
    }

    /// The most recent status snapshot published by an entity's scheduler.
    pub fn last_published_status(&self, entity: &EntityId) -> Option<EntityStatus> {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .get(&entity.scheduler_id())
            .cloned()
    }

    /// Responses delivered to `parent_instance` that nobody picked up yet.
    pub async fn pending_response_count(&self, parent_instance: &str) -> usize {
        self.inner
            .lock()
            .await
            .responses
            .get(parent_instance)
            .map_or(0, |m| m.len())
    }

    /// Whether a scheduler instance currently exists for the entity.
    pub async fn instance_exists(&self, entity: &EntityId) -> bool {
        self.inner
            .lock()
            .await
            .states
            .contains_key(&entity.scheduler_id())
    }
}

#[async_trait]
impl Host for InMemoryHost {
    fn new_guid(&self) -> String {
        let n = self.guid_counter.fetch_add(1, Ordering::Relaxed);
        format!("00000000-0000-4000-8000-{n:012x}")
    }

    fn now_ms(&self) -> u64 {
        LOGICAL_EPOCH_MS + self.clock_ticks.fetch_add(1, Ordering::Relaxed)
    }

    async fn call_activity(&self, name: &str, input: String) -> Result<String, String> {
        match self.activities.get(name) {
            Some(f) => f(input).await,
            None => Err(format!("unregistered activity: {name}")),
        }
    }

    fn publish_status(&self, entity: &EntityId, status: EntityStatus) {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .insert(entity.scheduler_id(), status);
    }
}

#[async_trait]
impl EntityTransport for InMemoryHost {
    async fn send_request(
        &self,
        target_instance: &str,
        message: RequestMessage,
    ) -> Result<(), String> {
        // Reject garbage addresses up front; a real runtime would dead-letter.
        EntityId::from_scheduler_id(target_instance)?;
        {
            let mut inner = self.inner.lock().await;
            inner
                .mailboxes
                .entry(target_instance.to_string())
                .or_default()
                .push(message);
        }
        self.pump().await
    }

    async fn take_response(
        &self,
        parent_instance: &str,
        correlation_id: &str,
    ) -> Result<Option<ResponseMessage>, String> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .responses
            .get_mut(parent_instance)
            .and_then(|m| m.remove(correlation_id)))
    }

    async fn read_state(&self, instance: &str) -> Result<Option<String>, String> {
        Ok(self.inner.lock().await.states.get(instance).cloned())
    }

    fn new_guid(&self) -> String {
        Host::new_guid(self)
    }
}

/// Builder for [`InMemoryHost`].
pub struct InMemoryHostBuilder {
    mode: Option<DispatchMode>,
    options: SchedulerOptions,
    activities: HashMap<String, ActivityFn>,
}

impl InMemoryHostBuilder {
    /// Dispatch in-process against this registry.
    pub fn registry(mut self, registry: EntityRegistry) -> Self {
        self.mode = Some(DispatchMode::InProcess(registry));
        self
    }

    /// Use an explicit dispatch mode (e.g. out-of-process).
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an activity handlers can call via
    /// [`crate::EntityContext::call_activity`].
    pub fn activity<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.activities
            .insert(name.into(), Arc::new(move |input| Box::pin(f(input))));
        self
    }

    pub fn build(self) -> Arc<InMemoryHost> {
        Arc::new_cyclic(|weak| InMemoryHost {
            mode: self
                .mode
                .unwrap_or_else(|| DispatchMode::InProcess(EntityRegistry::default())),
            options: self.options,
            activities: self.activities,
            inner: Mutex::new(HostInner::default()),
            pump_gate: Mutex::new(()),
            statuses: std::sync::Mutex::new(HashMap::new()),
            guid_counter: AtomicU64::new(0),
            clock_ticks: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }
}
