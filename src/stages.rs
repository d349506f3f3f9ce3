//! The individual steps of a dispatch: load snapshot state, replay events,
//! invoke the handler, persist the raised events.
//!
//! Each stage is a plain function returning `Result`, so the dispatcher can
//! chain them through a [`Pipeline`](crate::Pipeline) and stop at the first
//! failure.

use std::fmt;

use crate::aggregate::{AggregateDefinition, AggregateResult, State};
use crate::command::CommandHandler;
use crate::error::DispatchError;
use crate::message::Message;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::{EventStore, EventStream, empty_stream};

/// Names the steps of a dispatch, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    DefinitionResolved,
    StateLoaded,
    StateReconstituted,
    HandlerInvoked,
    EventsPersisted,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DefinitionResolved => "definition_resolved",
            Self::StateLoaded => "state_loaded",
            Self::StateReconstituted => "state_reconstituted",
            Self::HandlerInvoked => "handler_invoked",
            Self::EventsPersisted => "events_persisted",
        };
        f.write_str(name)
    }
}

/// Load the latest snapshot state for the aggregate `message` targets.
///
/// Without a snapshot store, or when no snapshot exists, the state is
/// empty and replay starts from the beginning.
///
/// # Errors
///
/// - [`DispatchError::MissingRequiredField`] if the message has no id.
/// - [`DispatchError::Collaborator`] if the snapshot store fails.
pub fn load_state(
    snapshot_store: Option<&dyn SnapshotStore>,
    message: &Message,
    definition: &dyn AggregateDefinition,
) -> Result<State, DispatchError> {
    let Some(store) = snapshot_store else {
        return Ok(State::new());
    };

    let aggregate_id = definition.extract_aggregate_id(message)?;
    match store.get(definition.aggregate_type(), &aggregate_id)? {
        Some(snapshot) => {
            tracing::debug!(
                aggregate_type = definition.aggregate_type(),
                aggregate_id = %aggregate_id,
                version = snapshot.last_version,
                "snapshot loaded"
            );
            Ok(snapshot.state)
        }
        None => Ok(State::new()),
    }
}

/// First version not yet folded into `state`: 1 for empty state, else
/// the state's version plus one.
///
/// # Errors
///
/// [`DispatchError::MissingRequiredField`] if a non-empty state has no
/// version.
pub fn next_version(state: &State, definition: &dyn AggregateDefinition) -> Result<u64, DispatchError> {
    if state.is_empty() {
        Ok(1)
    } else {
        Ok(definition.extract_aggregate_version(state)? + 1)
    }
}

/// How the event history is read back for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPlan {
    /// No prior state: replay the whole history.
    FullReplay,
    /// State came from a snapshot: replay only versions at or above
    /// `from_version`.
    CatchUp { from_version: u64 },
}

impl ReplayPlan {
    /// Choose the plan for `state`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::MissingRequiredField`] if a non-empty state has no
    /// version.
    pub fn for_state(state: &State, definition: &dyn AggregateDefinition) -> Result<Self, DispatchError> {
        match next_version(state, definition)? {
            1 => Ok(Self::FullReplay),
            from_version => Ok(Self::CatchUp { from_version }),
        }
    }

    pub fn from_version(&self) -> u64 {
        match self {
            Self::FullReplay => 1,
            Self::CatchUp { from_version } => *from_version,
        }
    }
}

/// Load the events that still need folding onto `state`.
///
/// A missing stream yields an empty sequence. When the definition supplies
/// a metadata matcher the stream is read from position 1 and filtered by
/// it; otherwise reading starts at the stream position equal to the next
/// version.
///
/// # Errors
///
/// - [`DispatchError::MissingRequiredField`] for a missing id or version.
/// - [`DispatchError::Collaborator`] if the event store fails.
pub fn load_events(
    event_store: &dyn EventStore,
    message: &Message,
    definition: &dyn AggregateDefinition,
    state: &State,
) -> Result<EventStream, DispatchError> {
    let aggregate_id = definition.extract_aggregate_id(message)?;
    let plan = ReplayPlan::for_state(state, definition)?;
    let stream = definition.stream_name(&aggregate_id);

    if !event_store.has_stream(&stream)? {
        tracing::debug!(stream = %stream, "stream does not exist yet, nothing to replay");
        return Ok(empty_stream());
    }

    let events = match definition.metadata_matcher(&aggregate_id, plan.from_version()) {
        Some(matcher) => event_store.load(&stream, 1, None, Some(&matcher))?,
        None => event_store.load(&stream, plan.from_version(), None, None)?,
    };
    tracing::debug!(stream = %stream, ?plan, "replaying events");
    Ok(events)
}

/// Fold the outstanding events onto `state`.
///
/// # Errors
///
/// Propagates the errors of [`load_events`].
pub fn reconstitute(
    event_store: &dyn EventStore,
    message: &Message,
    definition: &dyn AggregateDefinition,
    state: State,
) -> Result<State, DispatchError> {
    let mut events = load_events(event_store, message, definition, &state)?;
    Ok(definition.reconstitute_state(state, &mut events))
}

/// Run `handler` and check the shape of what it returned.
///
/// # Errors
///
/// - [`DispatchError::Rejected`] if the handler rejects the command.
/// - [`DispatchError::InvalidHandlerResult`] if it raised a message that
///   is not an event.
pub fn invoke_handler(
    handler: &dyn CommandHandler,
    state: State,
    message: &Message,
) -> Result<AggregateResult, DispatchError> {
    let result = handler
        .handle(state, message)
        .map_err(|source| DispatchError::Rejected {
            command: message.message_name().to_owned(),
            source,
        })?;

    if let Some(stray) = result.raised_events().iter().find(|m| !m.is_event()) {
        return Err(DispatchError::InvalidHandlerResult {
            command: message.message_name().to_owned(),
            reason: format!("raised `{}`, which is not an event", stray.message_name()),
        });
    }
    Ok(result)
}

/// Enrich the raised events and write them to the aggregate's stream.
///
/// The stream is appended to when it exists and created otherwise. The
/// returned result carries the enriched events, i.e. exactly what was
/// stored. The new state must carry a version even when no events were
/// raised; a result with no events is then returned without touching the
/// store.
///
/// # Errors
///
/// - [`DispatchError::MissingRequiredField`] if the new state has no version.
/// - [`DispatchError::Collaborator`] if the store rejects the write.
pub fn persist_events(
    result: AggregateResult,
    event_store: &dyn EventStore,
    definition: &dyn AggregateDefinition,
    aggregate_id: &str,
) -> Result<AggregateResult, DispatchError> {
    let version = definition.extract_aggregate_version(result.state())?;
    if result.raised_events().is_empty() {
        return Ok(result);
    }

    let (state, raised) = result.into_parts();
    let enriched: Vec<Message> = match definition.metadata_enricher(aggregate_id, version, None) {
        Some(enricher) => raised.into_iter().map(|e| enricher.enrich(e)).collect(),
        None => raised,
    };

    let stream = definition.stream_name(aggregate_id);
    let count = enriched.len();
    if event_store.has_stream(&stream)? {
        event_store.append_to(&stream, enriched.clone())?;
    } else {
        event_store.create(&stream, enriched.clone())?;
    }

    tracing::info!(stream = %stream, version, count, "events appended");
    Ok(AggregateResult::new(enriched, state))
}

/// Save a snapshot of `result` when its version falls on `interval`.
///
/// Failures are logged and do not fail the dispatch.
pub fn take_snapshot(
    snapshot_store: &dyn SnapshotStore,
    result: &AggregateResult,
    definition: &dyn AggregateDefinition,
    aggregate_id: &str,
    interval: u64,
) {
    let Ok(version) = definition.extract_aggregate_version(result.state()) else {
        return;
    };
    if interval == 0 || version % interval != 0 {
        return;
    }

    let snapshot = Snapshot::new(
        definition.aggregate_type(),
        aggregate_id,
        result.state().clone(),
        version,
    );
    match snapshot_store.save(vec![snapshot]) {
        Ok(()) => tracing::debug!(aggregate_id = %aggregate_id, version, "snapshot saved"),
        Err(e) => tracing::warn!(
            aggregate_id = %aggregate_id,
            version,
            error = %e,
            "failed to save snapshot; continuing without it"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{UserDefinition, change_user_name, register_user, state};
    use crate::aggregate::{AGGREGATE_ID, AGGREGATE_TYPE, AGGREGATE_VERSION};
    use crate::error::{HandlerError, StoreError};
    use crate::memory::{InMemoryEventStore, InMemorySnapshotStore};
    use crate::store::StreamName;
    use serde_json::json;

    fn register_cmd() -> Message {
        Message::command(
            "RegisterUser",
            json!({"id": "1", "name": "Alex", "email": "member@x.org"}),
        )
        .unwrap()
    }

    fn rename_cmd(name: &str) -> Message {
        Message::command("ChangeUserName", json!({"id": "1", "name": name})).unwrap()
    }

    fn stamped(name: &str, payload: serde_json::Value, version: u64) -> Message {
        Message::event(name, payload)
            .unwrap()
            .with_added_metadata(AGGREGATE_ID, "1")
            .with_added_metadata(AGGREGATE_TYPE, "user")
            .with_added_metadata(AGGREGATE_VERSION, version)
    }

    #[test]
    fn load_state_without_snapshot_store_is_empty() {
        let loaded = load_state(None, &register_cmd(), &UserDefinition).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn load_state_returns_snapshot_state() {
        let snapshots = InMemorySnapshotStore::new();
        let snap_state = state(json!({"id": "1", "name": "Alex", "version": 1}));
        snapshots
            .save(vec![Snapshot::new("user", "1", snap_state.clone(), 1)])
            .unwrap();

        let loaded = load_state(Some(&snapshots), &rename_cmd("Sascha"), &UserDefinition).unwrap();
        assert_eq!(loaded, snap_state);
    }

    #[test]
    fn load_state_missing_snapshot_is_empty_not_error() {
        let snapshots = InMemorySnapshotStore::new();
        let loaded = load_state(Some(&snapshots), &register_cmd(), &UserDefinition).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn load_state_requires_an_id_when_snapshots_are_configured() {
        let snapshots = InMemorySnapshotStore::new();
        let cmd = Message::command("RegisterUser", json!({"name": "Alex"})).unwrap();
        let err = load_state(Some(&snapshots), &cmd, &UserDefinition).unwrap_err();
        assert!(matches!(err, DispatchError::MissingRequiredField(_)));
    }

    #[test]
    fn next_version_for_empty_and_versioned_state() {
        assert_eq!(next_version(&State::new(), &UserDefinition).unwrap(), 1);
        let s = state(json!({"id": "1", "version": 4}));
        assert_eq!(next_version(&s, &UserDefinition).unwrap(), 5);
    }

    #[test]
    fn replay_plan_distinguishes_full_replay_from_catch_up() {
        assert_eq!(
            ReplayPlan::for_state(&State::new(), &UserDefinition).unwrap(),
            ReplayPlan::FullReplay
        );
        let s = state(json!({"id": "1", "version": 2}));
        assert_eq!(
            ReplayPlan::for_state(&s, &UserDefinition).unwrap(),
            ReplayPlan::CatchUp { from_version: 3 }
        );
    }

    #[test]
    fn load_events_from_missing_stream_is_empty() {
        let store = InMemoryEventStore::new();
        let events = load_events(&store, &register_cmd(), &UserDefinition, &State::new()).unwrap();
        assert_eq!(events.count(), 0);
    }

    #[test]
    fn full_replay_reads_whole_history() {
        let store = InMemoryEventStore::new();
        store
            .create(
                &StreamName::new("user-1"),
                vec![
                    stamped("UserRegistered", json!({"id": "1", "name": "Alex"}), 1),
                    stamped("UserNameChanged", json!({"id": "1", "name": "Sascha"}), 2),
                ],
            )
            .unwrap();

        let rebuilt = reconstitute(&store, &rename_cmd("Kim"), &UserDefinition, State::new()).unwrap();
        assert_eq!(rebuilt, state(json!({"id": "1", "name": "Sascha", "version": 2})));
    }

    #[test]
    fn catch_up_skips_versions_covered_by_snapshot() {
        let store = InMemoryEventStore::new();
        store
            .create(
                &StreamName::new("user-1"),
                vec![
                    stamped("UserRegistered", json!({"id": "1", "name": "Alex"}), 1),
                    stamped("UserNameChanged", json!({"id": "1", "name": "Sascha"}), 2),
                ],
            )
            .unwrap();

        let snapshot_state = state(json!({"id": "1", "name": "Alex", "version": 1}));
        let rebuilt =
            reconstitute(&store, &rename_cmd("Kim"), &UserDefinition, snapshot_state).unwrap();
        assert_eq!(rebuilt, state(json!({"id": "1", "name": "Sascha", "version": 2})));
    }

    #[test]
    fn catch_up_without_matcher_uses_stream_positions() {
        #[derive(Default)]
        struct Positional;
        impl AggregateDefinition for Positional {
            fn aggregate_type(&self) -> &str {
                "user"
            }
            fn apply(&self, state: State, event: &Message) -> State {
                UserDefinition.apply(state, event)
            }
            fn metadata_matcher(&self, _id: &str, _from: u64) -> Option<crate::MetadataMatcher> {
                None
            }
        }

        let store = InMemoryEventStore::new();
        store
            .create(
                &StreamName::new("user-1"),
                vec![
                    Message::event("UserRegistered", json!({"id": "1", "name": "Alex"})).unwrap(),
                    Message::event("UserNameChanged", json!({"id": "1", "name": "Sascha"})).unwrap(),
                ],
            )
            .unwrap();

        let snapshot_state = state(json!({"id": "1", "name": "Alex", "version": 1}));
        let rebuilt = reconstitute(&store, &rename_cmd("Kim"), &Positional, snapshot_state).unwrap();
        assert_eq!(rebuilt, state(json!({"id": "1", "name": "Sascha", "version": 2})));
    }

    #[test]
    fn invoke_handler_returns_handler_result() {
        let result = invoke_handler(&register_user, State::new(), &register_cmd()).unwrap();
        assert_eq!(result.raised_events().len(), 1);
        assert_eq!(result.state()["version"], json!(1));
    }

    #[test]
    fn invoke_handler_maps_rejection() {
        let err = invoke_handler(&change_user_name, State::new(), &rename_cmd("Kim")).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { ref command, .. } if command == "ChangeUserName"));
    }

    #[test]
    fn invoke_handler_rejects_raised_commands() {
        let handler = |state: State, _cmd: &Message| -> Result<AggregateResult, HandlerError> {
            let stray = Message::command("SendEmail", json!({}))?;
            Ok(AggregateResult::new(vec![stray], state))
        };
        let err = invoke_handler(&handler, State::new(), &register_cmd()).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidHandlerResult { .. }));
    }

    #[test]
    fn persist_creates_stream_with_enriched_events() {
        let store = InMemoryEventStore::new();
        let result = register_user(State::new(), &register_cmd()).unwrap();

        let persisted = persist_events(result, &store, &UserDefinition, "1").unwrap();
        let event = &persisted.raised_events()[0];
        assert_eq!(event.metadata_value(AGGREGATE_VERSION).and_then(|v| v.as_u64()), Some(1));
        assert_eq!(event.metadata_value(AGGREGATE_ID).and_then(|v| v.as_str()), Some("1"));

        let stored: Vec<Message> = store
            .load(&StreamName::new("user-1"), 1, None, None)
            .unwrap()
            .collect();
        assert_eq!(stored, persisted.raised_events());
    }

    #[test]
    fn persist_appends_to_existing_stream() {
        let store = InMemoryEventStore::new();
        let first = register_user(State::new(), &register_cmd()).unwrap();
        let first = persist_events(first, &store, &UserDefinition, "1").unwrap();

        let second = change_user_name(first.state().clone(), &rename_cmd("Sascha")).unwrap();
        persist_events(second, &store, &UserDefinition, "1").unwrap();

        let stored: Vec<Message> = store
            .load(&StreamName::new("user-1"), 1, None, None)
            .unwrap()
            .collect();
        let names: Vec<&str> = stored.iter().map(Message::message_name).collect();
        assert_eq!(names, vec!["UserRegistered", "UserNameChanged"]);
    }

    #[test]
    fn persist_requires_version_in_new_state() {
        let store = InMemoryEventStore::new();
        let event = Message::event("UserRegistered", json!({"id": "1"})).unwrap();
        let result = AggregateResult::new(vec![event], state(json!({"id": "1"})));
        let err = persist_events(result, &store, &UserDefinition, "1").unwrap_err();
        assert!(matches!(err, DispatchError::MissingRequiredField(f) if f == "version"));
        assert!(!store.has_stream(&StreamName::new("user-1")).unwrap());
    }

    #[test]
    fn persist_with_no_events_skips_the_store() {
        let store = InMemoryEventStore::new();
        let result = AggregateResult::new(Vec::new(), state(json!({"id": "1", "version": 1})));
        let persisted = persist_events(result.clone(), &store, &UserDefinition, "1").unwrap();
        assert_eq!(persisted, result);
        assert!(!store.has_stream(&StreamName::new("user-1")).unwrap());
    }

    #[test]
    fn persist_with_no_events_still_requires_version() {
        let store = InMemoryEventStore::new();
        let result = AggregateResult::new(Vec::new(), state(json!({"id": "1"})));
        let err = persist_events(result, &store, &UserDefinition, "1").unwrap_err();
        assert!(matches!(err, DispatchError::MissingRequiredField(f) if f == "version"));
        assert!(!store.has_stream(&StreamName::new("user-1")).unwrap());
    }

    #[test]
    fn persist_accepts_unchanged_version() {
        let store = InMemoryEventStore::new();
        let first = AggregateResult::new(
            vec![Message::event("UserRegistered", json!({"id": "1", "name": "Alex"})).unwrap()],
            state(json!({"id": "1", "name": "Alex", "version": 1})),
        );
        persist_events(first, &store, &UserDefinition, "1").unwrap();

        let second = AggregateResult::new(
            vec![Message::event("UserNameChanged", json!({"id": "1", "name": "Sascha"})).unwrap()],
            state(json!({"id": "1", "name": "Sascha", "version": 1})),
        );
        let persisted = persist_events(second, &store, &UserDefinition, "1").unwrap();
        assert_eq!(
            persisted.raised_events()[0]
                .metadata_value(AGGREGATE_VERSION)
                .and_then(|v| v.as_u64()),
            Some(1)
        );
        assert_eq!(store.event_count(), 2);
    }

    #[test]
    fn persist_surfaces_concurrency_conflict() {
        let store = InMemoryEventStore::new();
        let registered = register_user(State::new(), &register_cmd()).unwrap();
        let first = persist_events(registered.clone(), &store, &UserDefinition, "1").unwrap();
        let renamed = change_user_name(first.state().clone(), &rename_cmd("Sascha")).unwrap();
        persist_events(renamed, &store, &UserDefinition, "1").unwrap();

        // A second writer that still thinks it produced version 1.
        let err = persist_events(registered, &store, &UserDefinition, "1").unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Collaborator(StoreError::Concurrency { attempted: 1, current: 2, .. })
        ));
    }

    #[test]
    fn snapshot_taken_only_on_interval() {
        let snapshots = InMemorySnapshotStore::new();
        let at = |version: u64| {
            AggregateResult::new(Vec::new(), state(json!({"id": "1", "version": version})))
        };

        take_snapshot(&snapshots, &at(1), &UserDefinition, "1", 2);
        assert!(snapshots.get("user", "1").unwrap().is_none());

        take_snapshot(&snapshots, &at(2), &UserDefinition, "1", 2);
        let snap = snapshots.get("user", "1").unwrap().expect("snapshot at version 2");
        assert_eq!(snap.last_version, 2);
    }

    #[test]
    fn stage_names_display_in_snake_case() {
        assert_eq!(DispatchStage::EventsPersisted.to_string(), "events_persisted");
    }
}
