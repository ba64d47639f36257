//! Handlers delegating to activities through the host.

mod common;

use entoxide::{Client, ClientError, EntityClass, EntityContext, EntityRegistry, InMemoryHost};

use common::CALL_TIMEOUT;

fn greeter_class() -> EntityClass {
    EntityClass::builder("Greeter")
        .operation("greet", |ctx: EntityContext, name: String| async move {
            let formatted = ctx.call_activity("Format", name).await?;
            ctx.set_state(&formatted)?;
            ctx.return_value(&formatted)
        })
        .operation("greet_missing", |ctx: EntityContext, name: String| async move {
            let formatted = ctx.call_activity("NoSuchActivity", name).await?;
            ctx.return_value(&formatted)
        })
        .build()
}

fn setup() -> Client {
    common::init_tracing();
    let registry = EntityRegistry::builder().register(greeter_class()).build();
    let host = InMemoryHost::builder()
        .registry(registry)
        .activity("Format", |input: String| async move {
            Ok(format!("Hello, {input}!"))
        })
        .build();
    Client::new(host)
}

#[tokio::test]
async fn handler_awaits_activity_result() {
    let client = setup();
    let id = entoxide::EntityId::new("Greeter", "g1");
    let result = client
        .call_entity(&id, "greet", Some("World".into()), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result.as_deref(), Some("Hello, World!"));
}

#[tokio::test]
async fn unregistered_activity_fails_the_operation() {
    let client = setup();
    let id = entoxide::EntityId::new("Greeter", "g2");
    let err = client
        .call_entity(&id, "greet_missing", Some("World".into()), CALL_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        ClientError::Operation { details, .. } => {
            assert!(details.contains("unregistered activity"), "details: {details}");
        }
        other => panic!("expected operation failure, got {other}"),
    }
}
