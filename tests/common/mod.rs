use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use entoxide::{Client, EntityClass, EntityContext, EntityRegistry, InMemoryHost};

/// Default timeout for request/response calls in tests.
#[allow(dead_code)]
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

#[allow(dead_code)]
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

/// A numeric counter entity: set / add / increment / get.
#[allow(dead_code)]
pub fn counter_class() -> EntityClass {
    EntityClass::builder("Counter")
        .operation("set", |ctx: EntityContext, value: i64| async move {
            ctx.set_state(&value)
        })
        .operation("add", |ctx: EntityContext, amount: i64| async move {
            let value: i64 = ctx.get_state()?;
            ctx.set_state(&(value + amount))
        })
        .operation("increment", |ctx: EntityContext, _: ()| async move {
            let value: i64 = ctx.get_state()?;
            ctx.set_state(&(value + 1))
        })
        .operation("get", |ctx: EntityContext, _: ()| async move {
            let value: i64 = ctx.get_state()?;
            ctx.return_value(&value)
        })
        .build()
}

/// A string-store entity whose `get` refuses to run against an entity that
/// does not exist yet, and whose `delete` destructs it.
#[allow(dead_code)]
pub fn string_store_class() -> EntityClass {
    EntityClass::builder("StringStore")
        .operation("set", |ctx: EntityContext, value: String| async move {
            ctx.set_state(&value)
        })
        .operation("get", |ctx: EntityContext, _: ()| async move {
            if ctx.is_newly_constructed() {
                return Err("must not call get on a non-existing actor".to_string());
            }
            let value: String = ctx.get_state()?;
            ctx.return_value(&value)
        })
        .operation("delete", |ctx: EntityContext, _: ()| async move {
            ctx.destruct_on_exit();
            Ok(())
        })
        .build()
}

#[allow(dead_code)]
pub fn default_registry() -> EntityRegistry {
    EntityRegistry::builder()
        .register(counter_class())
        .register(string_store_class())
        .build()
}

#[allow(dead_code)]
pub fn setup() -> (Arc<InMemoryHost>, Client) {
    init_tracing();
    let host = InMemoryHost::builder().registry(default_registry()).build();
    let client = Client::new(host.clone());
    (host, client)
}
