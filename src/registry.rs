//! Registry mapping entity class names to their operation handlers.
//!
//! Dispatch is table-driven: `class name -> (operation name -> handler)`.
//! Typed façades over the raw string payloads are a registration-time
//! convenience, not a runtime requirement.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::EntityContext;

/// Why an operation handler did not complete normally. `Failed` carries the
/// user error; `Serialization` marks payload decode/encode problems, which
/// travel on the wire as a distinct failure kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    Failed(String),
    Serialization(String),
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::Failed(m) => write!(f, "{m}"),
            OperationError::Serialization(m) => write!(f, "serialization error: {m}"),
        }
    }
}

impl std::error::Error for OperationError {}

/// Trait implemented by operation handlers the dispatcher can invoke.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn invoke(&self, ctx: EntityContext, input: Option<String>) -> Result<(), OperationError>;
}

/// Function wrapper that implements `OperationHandler` over the raw payload.
pub struct FnOperation<F, Fut>(pub F)
where
    F: Fn(EntityContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OperationHandler for FnOperation<F, Fut>
where
    F: Fn(EntityContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext, input: Option<String>) -> Result<(), OperationError> {
        (self.0)(ctx, input).await.map_err(OperationError::Failed)
    }
}

/// Function wrapper that decodes the payload into a typed input first. Decode
/// failures surface as `OperationError::Serialization`, not a user failure.
struct TypedFnOperation<In, F, Fut>
where
    In: DeserializeOwned + Send + 'static,
    F: Fn(EntityContext, In) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    f: F,
    _marker: std::marker::PhantomData<fn(In) -> Fut>,
}

#[async_trait]
impl<In, F, Fut> OperationHandler for TypedFnOperation<In, F, Fut>
where
    In: DeserializeOwned + Send + 'static,
    F: Fn(EntityContext, In) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext, input: Option<String>) -> Result<(), OperationError> {
        let decoded: In = match input.as_deref() {
            Some(s) => Json::decode(s),
            None => Json::decode("null"),
        }
        .map_err(OperationError::Serialization)?;
        (self.f)(ctx, decoded).await.map_err(OperationError::Failed)
    }
}

/// One entity class: a name and its operation table.
pub struct EntityClass {
    name: String,
    operations: HashMap<String, Arc<dyn OperationHandler>>,
}

impl EntityClass {
    pub fn builder(name: impl Into<String>) -> EntityClassBuilder {
        EntityClassBuilder {
            name: name.into(),
            operations: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn resolve(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.operations.get(operation).cloned()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }
}

/// Builder for [`EntityClass`]. Registration errors (duplicates) are
/// collected; `build` ignores them, `build_result` reports them.
pub struct EntityClassBuilder {
    name: String,
    operations: HashMap<String, Arc<dyn OperationHandler>>,
    errors: Vec<String>,
}

impl EntityClassBuilder {
    /// Register a handler over the raw serialized payload.
    pub fn operation_raw<F, Fut>(mut self, operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(EntityContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let operation = operation.into();
        if self.operations.contains_key(&operation) {
            self.errors
                .push(format!("duplicate operation registration: {}/{operation}", self.name));
            return self;
        }
        self.operations.insert(operation, Arc::new(FnOperation(f)));
        self
    }

    /// Register a handler with a typed input. A missing payload decodes as
    /// JSON `null`, so `Option<T>` and `()` inputs accept absence.
    pub fn operation<In, F, Fut>(mut self, operation: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(EntityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let operation = operation.into();
        if self.operations.contains_key(&operation) {
            self.errors
                .push(format!("duplicate operation registration: {}/{operation}", self.name));
            return self;
        }
        self.operations.insert(
            operation,
            Arc::new(TypedFnOperation {
                f,
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    pub fn build(self) -> EntityClass {
        EntityClass {
            name: self.name,
            operations: self.operations,
        }
    }

    pub fn build_result(self) -> Result<EntityClass, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

/// Immutable registry of entity classes.
pub struct EntityRegistry {
    inner: Arc<HashMap<String, Arc<EntityClass>>>,
}

impl Clone for EntityRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve_class(&self, class_name: &str) -> Option<Arc<EntityClass>> {
        let result = self.inner.get(class_name).cloned();
        if result.is_none() {
            self.log_registry_miss(class_name, None);
        }
        result
    }

    pub fn resolve_operation(
        &self,
        class_name: &str,
        operation: &str,
    ) -> Option<Arc<dyn OperationHandler>> {
        let class = self.inner.get(class_name)?;
        let result = class.resolve(operation);
        if result.is_none() {
            self.log_registry_miss(class_name, Some(operation));
        }
        result
    }

    pub fn has(&self, class_name: &str) -> bool {
        self.inner.contains_key(class_name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    fn log_registry_miss(&self, class_name: &str, operation: Option<&str>) {
        let registered: Vec<String> = self
            .inner
            .iter()
            .map(|(name, class)| format!("{name}: {:?}", class.operation_names()))
            .collect();
        tracing::debug!(
            target: "entoxide::registry",
            requested_class = %class_name,
            requested_operation = ?operation,
            registered_classes = ?registered,
            "registry lookup miss"
        );
    }
}

/// Builder for [`EntityRegistry`].
pub struct EntityRegistryBuilder {
    map: HashMap<String, Arc<EntityClass>>,
    errors: Vec<String>,
}

impl EntityRegistryBuilder {
    pub fn register(mut self, class: EntityClass) -> Self {
        if self.map.contains_key(class.name()) {
            self.errors
                .push(format!("duplicate entity class registration: {}", class.name()));
            return self;
        }
        self.map.insert(class.name().to_string(), Arc::new(class));
        self
    }

    pub fn build(self) -> EntityRegistry {
        EntityRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<EntityRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}
