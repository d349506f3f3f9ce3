//! The command dispatcher and its builder.
//!
//! A [`CommandDispatcher`] owns a [`CommandMap`], the store factories, and
//! a [`DefinitionCache`]. Each call to [`dispatch`](CommandDispatcher::dispatch)
//! runs one command through the pipeline:
//!
//! ```text
//! resolve definition ─▶ load snapshot ─▶ replay events ─▶ handle ─▶ persist
//! ```
//!
//! Any stage may fail; the first failure is returned and nothing after it
//! runs. In particular a failing handler never causes a store write.

use std::num::NonZeroU64;
use std::sync::Arc;

use crate::aggregate::{AggregateDefinition, AggregateResult, State};
use crate::command::{CommandMap, get_handler};
use crate::definition_cache::DefinitionCache;
use crate::error::{BuildError, DispatchError, HandlerError};
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::snapshot::{SnapshotStore, SnapshotStoreFactory};
use crate::stages::{self, DispatchStage};
use crate::store::{EventStore, EventStoreFactory};

/// Tuning knobs for a [`CommandDispatcher`].
///
/// # Examples
///
/// ```
/// use std::num::NonZeroU64;
/// use eventfold_dispatch::DispatcherConfig;
///
/// let config = DispatcherConfig {
///     snapshot_interval: NonZeroU64::new(50),
///     ..DispatcherConfig::default()
/// };
/// assert_eq!(config.snapshot_interval.map(NonZeroU64::get), Some(50));
/// assert_eq!(DispatcherConfig::default(), DispatcherConfig::DEFAULT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Save a snapshot after a dispatch whose resulting version is a
    /// multiple of this interval. Ignored without a snapshot store.
    ///
    /// Default: `None` (never snapshot).
    pub snapshot_interval: Option<NonZeroU64>,
}

impl DispatcherConfig {
    pub const DEFAULT: Self = Self {
        snapshot_interval: None,
    };
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Everything a dispatch needs once the command has been routed.
struct Routed {
    message: Message,
    definition: Arc<dyn AggregateDefinition>,
    aggregate_id: String,
    event_store: Arc<dyn EventStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

/// Routes commands to handlers and persists the events they raise.
///
/// `CommandDispatcher` is `Send + Sync`; share it behind an `Arc` to
/// dispatch from several threads. Concurrent commands for the same
/// aggregate are arbitrated by the event store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_dispatch::{
///     AggregateDefinition, AggregateResult, CommandDispatcher, CommandMap, InMemoryEventStore,
///     Message, State, shared_event_store,
/// };
/// use serde_json::{Value, json};
///
/// #[derive(Default)]
/// struct Counter;
///
/// impl AggregateDefinition for Counter {
///     fn aggregate_type(&self) -> &str {
///         "counter"
///     }
///     fn apply(&self, mut state: State, event: &Message) -> State {
///         let version = state.get("version").and_then(Value::as_u64).unwrap_or(0) + 1;
///         state.insert("id".into(), event.payload()["id"].clone());
///         state.insert("version".into(), json!(version));
///         state
///     }
/// }
///
/// let map = CommandMap::new().register::<Counter, _>("Increment", |state, cmd| {
///     let event = Message::event("Incremented", json!({"id": cmd.payload()["id"]}))?;
///     let state = Counter.apply(state, &event);
///     Ok(AggregateResult::new(vec![event], state))
/// });
///
/// let dispatcher = CommandDispatcher::builder()
///     .command_map(map)
///     .event_store(shared_event_store(Arc::new(InMemoryEventStore::new())))
///     .build()
///     .expect("event store is configured");
///
/// let cmd = Message::command("Increment", json!({"id": "c-1"})).unwrap();
/// let result = dispatcher.dispatch(cmd.clone()).unwrap();
/// assert_eq!(result.state()["version"], 1);
///
/// let result = dispatcher.dispatch(cmd).unwrap();
/// assert_eq!(result.state()["version"], 2);
/// ```
pub struct CommandDispatcher {
    command_map: Arc<CommandMap>,
    event_store: EventStoreFactory,
    snapshot_store: Option<SnapshotStoreFactory>,
    definitions: DefinitionCache,
    config: DispatcherConfig,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("commands", &self.command_map.len())
            .field("snapshots", &self.snapshot_store.is_some())
            .field("definitions", &self.definitions)
            .field("config", &self.config)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn builder() -> CommandDispatcherBuilder {
        CommandDispatcherBuilder::new()
    }

    pub fn command_map(&self) -> &CommandMap {
        &self.command_map
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The cached definition serving `command_name`, built on first use.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownCommand`] if the command is not routed.
    pub fn definition_for(
        &self,
        command_name: &str,
    ) -> Result<Arc<dyn AggregateDefinition>, DispatchError> {
        self.definitions.get(command_name, &self.command_map)
    }

    /// Run `message` through the pipeline.
    ///
    /// On success the returned result holds the new state and the events
    /// exactly as they were persisted, enriched with aggregate metadata.
    ///
    /// # Errors
    ///
    /// Returns the [`DispatchError`] of the first failing stage. When the
    /// error comes from any stage before persistence, nothing was written.
    pub fn dispatch(&self, message: Message) -> Result<AggregateResult, DispatchError> {
        let _span = tracing::info_span!(
            "dispatch",
            command = %message.message_name(),
            message_id = %message.uuid(),
        )
        .entered();

        let result = self.pipeline().run(message);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "dispatch failed");
        }
        result
    }

    fn pipeline(&self) -> Pipeline<'_, Message, AggregateResult, DispatchError> {
        Pipeline::<Message, Message, DispatchError>::new()
            .then(move |message| self.route(message))
            .then(move |routed| self.load_state(routed))
            .then(move |(routed, state)| self.reconstitute(routed, state))
            .then(move |(routed, state)| self.handle(routed, state))
            .then(move |(routed, result)| self.persist(routed, result))
    }

    fn route(&self, message: Message) -> Result<Routed, DispatchError> {
        let definition = self.definitions.get(message.message_name(), &self.command_map)?;
        let aggregate_id = definition.extract_aggregate_id(&message)?;

        let event_store = (self.event_store)().map_err(|source| {
            DispatchError::BadCollaboratorFactory {
                collaborator: "event store",
                source,
            }
        })?;
        let snapshot_store = self
            .snapshot_store
            .as_ref()
            .map(|factory| factory())
            .transpose()
            .map_err(|source| DispatchError::BadCollaboratorFactory {
                collaborator: "snapshot store",
                source,
            })?;

        tracing::debug!(stage = %DispatchStage::DefinitionResolved, aggregate_id = %aggregate_id);
        Ok(Routed {
            message,
            definition,
            aggregate_id,
            event_store,
            snapshot_store,
        })
    }

    fn load_state(&self, routed: Routed) -> Result<(Routed, State), DispatchError> {
        let state = stages::load_state(
            routed.snapshot_store.as_deref(),
            &routed.message,
            routed.definition.as_ref(),
        )?;
        tracing::debug!(stage = %DispatchStage::StateLoaded, from_snapshot = !state.is_empty());
        Ok((routed, state))
    }

    fn reconstitute(&self, routed: Routed, state: State) -> Result<(Routed, State), DispatchError> {
        let state = stages::reconstitute(
            routed.event_store.as_ref(),
            &routed.message,
            routed.definition.as_ref(),
            state,
        )?;
        tracing::debug!(stage = %DispatchStage::StateReconstituted);
        Ok((routed, state))
    }

    fn handle(&self, routed: Routed, state: State) -> Result<(Routed, AggregateResult), DispatchError> {
        let handler = get_handler(&routed.message, &self.command_map)?;
        let result = stages::invoke_handler(handler, state, &routed.message)?;
        tracing::debug!(
            stage = %DispatchStage::HandlerInvoked,
            raised = result.raised_events().len()
        );
        Ok((routed, result))
    }

    fn persist(&self, routed: Routed, result: AggregateResult) -> Result<AggregateResult, DispatchError> {
        let result = stages::persist_events(
            result,
            routed.event_store.as_ref(),
            routed.definition.as_ref(),
            &routed.aggregate_id,
        )?;
        tracing::debug!(stage = %DispatchStage::EventsPersisted);

        if let (Some(interval), Some(store)) =
            (self.config.snapshot_interval, routed.snapshot_store.as_deref())
            && !result.raised_events().is_empty()
        {
            stages::take_snapshot(
                store,
                &result,
                routed.definition.as_ref(),
                &routed.aggregate_id,
                interval.get(),
            );
        }
        Ok(result)
    }
}

/// Builder for a [`CommandDispatcher`].
///
/// An event store factory is required; everything else is optional.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::{BuildError, CommandDispatcher};
///
/// let err = CommandDispatcher::builder().build().unwrap_err();
/// assert!(matches!(err, BuildError::MissingEventStore));
/// ```
#[derive(Default)]
pub struct CommandDispatcherBuilder {
    command_map: CommandMap,
    event_store: Option<EventStoreFactory>,
    snapshot_store: Option<SnapshotStoreFactory>,
    config: DispatcherConfig,
}

impl CommandDispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `map` for routing, replacing any routes added so far.
    pub fn command_map(mut self, map: CommandMap) -> Self {
        self.command_map = map;
        self
    }

    /// Add a single route. See [`CommandMap::route`].
    pub fn route<H, F>(mut self, command_name: impl Into<String>, handler: H, definition: F) -> Self
    where
        H: Fn(State, &Message) -> Result<AggregateResult, HandlerError> + Send + Sync + 'static,
        F: Fn() -> Arc<dyn AggregateDefinition> + Send + Sync + 'static,
    {
        self.command_map = self.command_map.route(command_name, handler, definition);
        self
    }

    /// Factory called once per dispatch for the event store.
    pub fn event_store(mut self, factory: EventStoreFactory) -> Self {
        self.event_store = Some(factory);
        self
    }

    /// Factory called once per dispatch for the snapshot store.
    ///
    /// Without one, every dispatch replays the full history.
    pub fn snapshot_store(mut self, factory: SnapshotStoreFactory) -> Self {
        self.snapshot_store = Some(factory);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building.
    ///
    /// # Errors
    ///
    /// [`BuildError::MissingEventStore`] if no event store factory was set.
    pub fn build(self) -> Result<CommandDispatcher, BuildError> {
        let event_store = self.event_store.ok_or(BuildError::MissingEventStore)?;
        Ok(CommandDispatcher {
            command_map: Arc::new(self.command_map),
            event_store,
            snapshot_store: self.snapshot_store,
            definitions: DefinitionCache::new(),
            config: self.config,
        })
    }
}

/// Build a dispatch function over `command_map` and the given store
/// factories.
///
/// The returned closure owns its own definition cache, so definitions are
/// shared across all calls made through it.
pub fn build_command_dispatcher(
    command_map: CommandMap,
    event_store: EventStoreFactory,
    snapshot_store: Option<SnapshotStoreFactory>,
) -> impl Fn(Message) -> Result<AggregateResult, DispatchError> + Send + Sync {
    let dispatcher = CommandDispatcher {
        command_map: Arc::new(command_map),
        event_store,
        snapshot_store,
        definitions: DefinitionCache::new(),
        config: DispatcherConfig::DEFAULT,
    };
    move |message| dispatcher.dispatch(message)
}
