//! Self-contained example: register a user, rename them, and inspect the
//! stored stream and snapshot, all against the in-memory stores.
//!
//! Run with: `RUST_LOG=debug cargo run --example register_user`

use std::num::NonZeroU64;
use std::sync::Arc;

use eventfold_dispatch::{
    AGGREGATE_VERSION, AggregateDefinition, AggregateResult, CommandDispatcher, CommandMap,
    DispatcherConfig, EventStore, HandlerError, InMemoryEventStore, InMemorySnapshotStore,
    Message, SnapshotStore, State, StreamName, shared_event_store, shared_snapshot_store,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// User aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct User;

impl AggregateDefinition for User {
    fn aggregate_type(&self) -> &str {
        "user"
    }

    fn apply(&self, mut state: State, event: &Message) -> State {
        match event.message_name() {
            "UserRegistered" | "UserNameChanged" => {
                for (key, value) in event.payload() {
                    state.insert(key.clone(), value.clone());
                }
                let version = state.get("version").and_then(Value::as_u64).unwrap_or(0) + 1;
                state.insert("version".into(), json!(version));
            }
            _ => {} // Forward compatibility: ignore unknown events.
        }
        state
    }
}

#[derive(Debug, thiserror::Error)]
enum UserError {
    #[error("user is already registered")]
    AlreadyRegistered,
    #[error("user is not registered")]
    NotRegistered,
}

fn register_user(state: State, cmd: &Message) -> Result<AggregateResult, HandlerError> {
    if !state.is_empty() {
        return Err(Box::new(UserError::AlreadyRegistered));
    }
    let event = Message::event("UserRegistered", Value::Object(cmd.payload().clone()))?;
    let state = User.apply(state, &event);
    Ok(AggregateResult::new(vec![event], state))
}

fn change_user_name(state: State, cmd: &Message) -> Result<AggregateResult, HandlerError> {
    if state.is_empty() {
        return Err(Box::new(UserError::NotRegistered));
    }
    let event = Message::event(
        "UserNameChanged",
        json!({"id": cmd.payload()["id"], "name": cmd.payload()["name"]}),
    )?;
    let state = User.apply(state, &event);
    Ok(AggregateResult::new(vec![event], state))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let events = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());

    let dispatcher = CommandDispatcher::builder()
        .command_map(
            CommandMap::new()
                .register::<User, _>("RegisterUser", register_user)
                .register::<User, _>("ChangeUserName", change_user_name),
        )
        .event_store(shared_event_store(events.clone()))
        .snapshot_store(shared_snapshot_store(snapshots.clone()))
        .config(DispatcherConfig {
            snapshot_interval: NonZeroU64::new(2),
        })
        .build()?;

    let register = Message::command(
        "RegisterUser",
        json!({"id": "1", "name": "Alex", "email": "member@x.org"}),
    )?;
    dispatcher.dispatch(register.clone())?;

    // Registering twice is rejected by the handler; nothing is written.
    match dispatcher.dispatch(register) {
        Ok(_) => return Err("duplicate registration should be rejected".into()),
        Err(e) => println!("rejected: {e}"),
    }

    let rename = Message::command("ChangeUserName", json!({"id": "1", "name": "Sascha"}))?;
    let result = dispatcher.dispatch(rename)?;
    println!("state: {}", Value::Object(result.state().clone()));

    for event in events.load(&StreamName::new("user-1"), 1, None, None)? {
        let version = event
            .metadata_value(AGGREGATE_VERSION)
            .map(ToString::to_string)
            .unwrap_or_default();
        println!("  v{version} {}", event.message_name());
    }

    let snapshot = snapshots.get("user", "1")?.ok_or("expected a snapshot at version 2")?;
    println!("snapshot at version {}", snapshot.last_version);

    assert_eq!(result.state()["name"], "Sascha");
    assert_eq!(events.event_count(), 2);
    println!("all assertions passed");

    Ok(())
}
