//! Command dispatch for event-sourced aggregates.
//!
//! A command is routed to its handler, the aggregate's state is rebuilt
//! from an optional snapshot plus the events stored since, the handler
//! decides which events to raise, and those events are enriched with
//! aggregate metadata and appended to the aggregate's stream.

mod aggregate;
pub use aggregate::{
    AGGREGATE_ID, AGGREGATE_TYPE, AGGREGATE_VERSION, AggregateDefinition, AggregateResult,
    CAUSATION_ID, CAUSATION_NAME, MetadataEnricher, State,
};
mod command;
pub use command::{CommandHandler, CommandMap, CommandRoute, DefinitionFactory, get_handler};
mod definition_cache;
mod dispatcher;
mod error;
mod matcher;
mod memory;
mod message;
mod pipeline;
mod snapshot;
pub mod stages;
mod store;

pub use definition_cache::DefinitionCache;
pub use dispatcher::{
    CommandDispatcher, CommandDispatcherBuilder, DispatcherConfig, build_command_dispatcher,
};
pub use error::{BuildError, DispatchError, HandlerError, StoreError};
pub use matcher::{Condition, MetadataMatcher, Operator};
pub use memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use message::{Fields, Message, MessageKind, Metadata, MetadataValue, PayloadNotObject};
pub use pipeline::{Pipeline, compose};
pub use snapshot::{Snapshot, SnapshotStore, SnapshotStoreFactory, shared_snapshot_store};
pub use store::{
    EventStore, EventStoreFactory, EventStream, StreamName, empty_stream, shared_event_store,
};
