//! Aggregate definitions, handler results, and metadata enrichment.

use serde_json::Value;

use crate::error::DispatchError;
use crate::matcher::{MetadataMatcher, Operator};
use crate::message::{Fields, Message, MetadataValue};
use crate::store::StreamName;

/// Aggregate state: a JSON object owned by the pipeline for one dispatch.
///
/// By convention it carries the identifier and version fields named by
/// the aggregate's definition. An empty object means "no prior state".
pub type State = Fields;

/// Metadata key holding the aggregate id.
pub const AGGREGATE_ID: &str = "_aggregate_id";
/// Metadata key holding the aggregate type.
pub const AGGREGATE_TYPE: &str = "_aggregate_type";
/// Metadata key holding the aggregate version after the command.
pub const AGGREGATE_VERSION: &str = "_aggregate_version";
/// Metadata key holding the causing message's uuid.
pub const CAUSATION_ID: &str = "_causation_id";
/// Metadata key holding the causing message's name.
pub const CAUSATION_NAME: &str = "_causation_name";

/// New state plus the ordered events a command handler raised.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    state: State,
    raised_events: Vec<Message>,
}

impl AggregateResult {
    /// Pair the events a handler raised with the state they produced.
    pub fn new(raised_events: Vec<Message>, state: State) -> Self {
        Self {
            state,
            raised_events,
        }
    }

    /// State after the command was handled.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Events in the order the handler raised them.
    pub fn raised_events(&self) -> &[Message] {
        &self.raised_events
    }

    /// Split into the new state and the raised events.
    pub fn into_parts(self) -> (State, Vec<Message>) {
        (self.state, self.raised_events)
    }
}

/// Stamps a fixed set of metadata entries onto events.
///
/// Entries are applied in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataEnricher {
    entries: Vec<(String, MetadataValue)>,
}

impl MetadataEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn entries(&self) -> &[(String, MetadataValue)] {
        &self.entries
    }

    /// Return `event` with every entry added to its metadata.
    pub fn enrich(&self, event: Message) -> Message {
        self.entries
            .iter()
            .fold(event, |event, (key, value)| {
                event.with_added_metadata(key.clone(), value.clone())
            })
    }
}

/// Describes how to identify, locate, and fold one aggregate type.
///
/// Implementations are stateless strategy objects; the dispatcher caches
/// one instance per command type. Only [`aggregate_type`] and [`apply`]
/// are required. The remaining methods default to a one-stream-per-
/// aggregate layout with `"id"` / `"version"` fields.
///
/// # Contract
///
/// - [`apply`] must be pure and total. Unknown events should leave the
///   state unchanged.
/// - Extraction methods fail with [`DispatchError::MissingRequiredField`]
///   before any I/O happens.
///
/// [`aggregate_type`]: AggregateDefinition::aggregate_type
/// [`apply`]: AggregateDefinition::apply
pub trait AggregateDefinition: Send + Sync + 'static {
    /// Stable type discriminator, e.g. `"user"`. Used for snapshot keys
    /// and stream names.
    fn aggregate_type(&self) -> &str;

    /// Fold a single event onto `state`.
    fn apply(&self, state: State, event: &Message) -> State;

    /// Field that holds the aggregate id in payloads and state.
    fn identifier_name(&self) -> &str {
        "id"
    }

    /// Field that holds the aggregate version in state.
    fn version_name(&self) -> &str {
        "version"
    }

    /// Read the aggregate id out of a command or event payload.
    ///
    /// String ids are returned as-is; integer ids are rendered in decimal.
    ///
    /// # Errors
    ///
    /// [`DispatchError::MissingRequiredField`] if the field is absent or is
    /// neither a string nor an integer.
    fn extract_aggregate_id(&self, message: &Message) -> Result<String, DispatchError> {
        let field = self.identifier_name();
        match message.payload().get(field) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            _ => Err(DispatchError::MissingRequiredField(field.to_owned())),
        }
    }

    /// Read the aggregate version out of a state (or payload) object.
    ///
    /// # Errors
    ///
    /// [`DispatchError::MissingRequiredField`] if the field is absent or is
    /// not an unsigned integer.
    fn extract_aggregate_version(&self, fields: &Fields) -> Result<u64, DispatchError> {
        let field = self.version_name();
        fields
            .get(field)
            .and_then(Value::as_u64)
            .ok_or_else(|| DispatchError::MissingRequiredField(field.to_owned()))
    }

    /// `true` when each aggregate owns its stream; `false` for one shared
    /// stream per aggregate type, disambiguated by metadata.
    fn has_one_stream_per_aggregate(&self) -> bool {
        true
    }

    /// Locate the event stream for `aggregate_id`.
    fn stream_name(&self, aggregate_id: &str) -> StreamName {
        if self.has_one_stream_per_aggregate() {
            StreamName::new(format!("{}-{aggregate_id}", self.aggregate_type()))
        } else {
            StreamName::new(self.aggregate_type())
        }
    }

    /// Filter selecting this aggregate's events at or above `from_version`.
    ///
    /// Returning `None` makes replay fall back to stream positions.
    fn metadata_matcher(&self, aggregate_id: &str, from_version: u64) -> Option<MetadataMatcher> {
        Some(
            MetadataMatcher::new()
                .with(AGGREGATE_ID, Operator::Equals, aggregate_id)
                .with(AGGREGATE_TYPE, Operator::Equals, self.aggregate_type())
                .with(AGGREGATE_VERSION, Operator::GreaterThanEquals, from_version),
        )
    }

    /// Enricher that stamps persisted events with aggregate metadata.
    ///
    /// The id is stamped first, then the entries from
    /// [`aggregate_metadata`](AggregateDefinition::aggregate_metadata).
    /// When `causation` is given, its uuid and name are stamped last.
    fn metadata_enricher(
        &self,
        aggregate_id: &str,
        aggregate_version: u64,
        causation: Option<&Message>,
    ) -> Option<MetadataEnricher> {
        let enricher = self
            .aggregate_metadata(aggregate_version)
            .into_iter()
            .fold(
                MetadataEnricher::new().with(AGGREGATE_ID, aggregate_id),
                |enricher, (key, value)| enricher.with(key, value),
            );

        Some(match causation {
            Some(cause) => enricher
                .with(CAUSATION_ID, cause.uuid())
                .with(CAUSATION_NAME, cause.message_name()),
            None => enricher,
        })
    }

    /// Type and version entries added by the default enricher.
    ///
    /// Override to customise stamping without re-implementing the id entry.
    fn aggregate_metadata(&self, aggregate_version: u64) -> Vec<(String, MetadataValue)> {
        vec![
            (AGGREGATE_TYPE.to_owned(), self.aggregate_type().into()),
            (AGGREGATE_VERSION.to_owned(), aggregate_version.into()),
        ]
    }

    /// Left-fold `events` onto `state` using [`apply`](AggregateDefinition::apply).
    fn reconstitute_state(&self, state: State, events: &mut dyn Iterator<Item = Message>) -> State {
        events.fold(state, |state, event| self.apply(state, &event))
    }
}
