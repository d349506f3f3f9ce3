//! Event store contract consumed by the dispatcher.
//!
//! The dispatcher never owns storage. It reaches a store through an
//! [`EventStoreFactory`] on every dispatch and uses four operations:
//! existence check, load, append, and create.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::matcher::MetadataMatcher;
use crate::message::Message;

/// Name identifying an event stream, e.g. `"user-1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    /// Wrap `name` as a stream name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A lazy, finite, forward-only sequence of loaded events.
pub type EventStream = Box<dyn Iterator<Item = Message> + Send>;

/// An empty [`EventStream`].
pub fn empty_stream() -> EventStream {
    Box::new(std::iter::empty())
}

/// Append-only stream storage.
///
/// Implementations own optimistic concurrency: `append_to` and `create`
/// must reject a write whose aggregate version has been superseded by a
/// concurrent writer, reporting [`StoreError::Concurrency`].
pub trait EventStore: Send + Sync {
    /// Whether `stream` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn has_stream(&self, stream: &StreamName) -> Result<bool, StoreError>;

    /// Load events from `stream`, starting at 1-based position `from`.
    ///
    /// At most `count` events are returned when given. When `matcher` is
    /// given only matching events are returned and positions still count
    /// every event in the stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist.
    fn load(
        &self,
        stream: &StreamName,
        from: u64,
        count: Option<usize>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream, StoreError>;

    /// Append `events`, in order, to an existing stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist,
    /// or [`StoreError::Concurrency`] on a version conflict.
    fn append_to(&self, stream: &StreamName, events: Vec<Message>) -> Result<(), StoreError>;

    /// Create `stream` with `events` as its initial contents.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamExists`] if the stream already exists.
    fn create(&self, stream: &StreamName, events: Vec<Message>) -> Result<(), StoreError>;
}

/// Produces the event store a dispatch talks to.
///
/// Called once per dispatch. An `Err` is reported to the caller as
/// [`DispatchError::BadCollaboratorFactory`](crate::DispatchError::BadCollaboratorFactory).
pub type EventStoreFactory =
    Arc<dyn Fn() -> Result<Arc<dyn EventStore>, StoreError> + Send + Sync>;

/// Wrap an existing store in a factory that always hands it out.
pub fn shared_event_store(store: Arc<dyn EventStore>) -> EventStoreFactory {
    Arc::new(move || Ok(Arc::clone(&store)))
}
