//! Crate-level error types for command dispatch and store collaborators.

use crate::store::StreamName;

/// Boxed error returned by a command handler that rejects a command.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when dispatching a command fails.
///
/// Every pipeline stage reports failures through this type. The first
/// error produced by any stage becomes the result of the dispatch and no
/// later stage runs.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No command-map entry for the message name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A payload or state lacked the identifier or version field.
    #[error("missing required field `{0}`")]
    MissingRequiredField(String),

    /// The handler produced a result the pipeline cannot persist.
    #[error("invalid result from handler for `{command}`: {reason}")]
    InvalidHandlerResult {
        /// Name of the command whose handler misbehaved.
        command: String,
        /// What was wrong with the result.
        reason: String,
    },

    /// The handler rejected the command.
    ///
    /// Wraps the handler's own error, forwarding its `Display` output.
    #[error("command `{command}` rejected: {source}")]
    Rejected {
        /// Name of the rejected command.
        command: String,
        /// The handler's error.
        #[source]
        source: HandlerError,
    },

    /// A store factory could not produce a usable store.
    #[error("{collaborator} factory failed: {source}")]
    BadCollaboratorFactory {
        /// Which collaborator the factory was meant to build.
        collaborator: &'static str,
        /// Why the factory failed.
        #[source]
        source: StoreError,
    },

    /// A store rejected a read or write.
    ///
    /// Surfaced as-is; optimistic concurrency conflicts arrive here.
    #[error(transparent)]
    Collaborator(#[from] StoreError),
}

/// Error reported by an event store or snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream does not exist.
    #[error("stream `{0}` not found")]
    StreamNotFound(StreamName),

    /// `create` was called for a stream that already exists.
    #[error("stream `{0}` already exists")]
    StreamExists(StreamName),

    /// A concurrent writer already persisted a newer aggregate version.
    #[error(
        "concurrency conflict on stream `{stream}` for aggregate `{aggregate_id}`: \
         version {attempted} is behind stored version {current}"
    )]
    Concurrency {
        /// Stream the write targeted.
        stream: StreamName,
        /// Aggregate whose version was superseded.
        aggregate_id: String,
        /// Version carried by the rejected events.
        attempted: u64,
        /// Latest version already stored.
        current: u64,
    },

    /// Disk or network I/O failure inside the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is not reachable or not configured correctly.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by [`CommandDispatcherBuilder::build`](crate::CommandDispatcherBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No event store factory was configured.
    #[error("an event store factory is required")]
    MissingEventStore,
}
