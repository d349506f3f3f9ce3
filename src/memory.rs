//! In-memory event and snapshot stores.
//!
//! Suitable for tests and single-process use. Both stores are cheap to
//! share behind an `Arc` and safe to use from many threads.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::aggregate::{AGGREGATE_ID, AGGREGATE_VERSION};
use crate::error::StoreError;
use crate::matcher::MetadataMatcher;
use crate::message::Message;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::{EventStore, EventStream, StreamName};

/// Streams of events held in a map, with optimistic concurrency on the
/// `_aggregate_version` metadata entry.
///
/// A write is rejected when any of its events carries an aggregate
/// version below the highest version already stored for the same
/// `(stream, _aggregate_id)`. Equal versions are accepted. Events without
/// version metadata are stored unchecked.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamName, Vec<Message>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all streams.
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Aggregate id and version stamped on `event`, if both are present.
fn stamped_version(event: &Message) -> Option<(String, u64)> {
    let id = event.metadata_value(AGGREGATE_ID)?.to_string();
    let version = event.metadata_value(AGGREGATE_VERSION)?.as_u64()?;
    Some((id, version))
}

/// Reject `incoming` if it carries a version older than what `existing` holds.
fn check_versions(
    stream: &StreamName,
    existing: &[Message],
    incoming: &[Message],
) -> Result<(), StoreError> {
    for (aggregate_id, attempted) in incoming.iter().filter_map(stamped_version) {
        let current = existing
            .iter()
            .filter_map(stamped_version)
            .filter(|(id, _)| *id == aggregate_id)
            .map(|(_, version)| version)
            .max();
        if let Some(current) = current
            && attempted < current
        {
            return Err(StoreError::Concurrency {
                stream: stream.clone(),
                aggregate_id,
                attempted,
                current,
            });
        }
    }
    Ok(())
}

impl EventStore for InMemoryEventStore {
    fn has_stream(&self, stream: &StreamName) -> Result<bool, StoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.contains_key(stream))
    }

    fn load(
        &self,
        stream: &StreamName,
        from: u64,
        count: Option<usize>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream, StoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let events = streams
            .get(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.clone()))?;

        let skip = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        let selected: Vec<Message> = events
            .iter()
            .skip(skip)
            .filter(|event| matcher.is_none_or(|m| m.matches(event)))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Box::new(selected.into_iter()))
    }

    fn append_to(&self, stream: &StreamName, events: Vec<Message>) -> Result<(), StoreError> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let existing = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.clone()))?;
        check_versions(stream, existing, &events)?;
        existing.extend(events);
        Ok(())
    }

    fn create(&self, stream: &StreamName, events: Vec<Message>) -> Result<(), StoreError> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(stream) {
            return Err(StoreError::StreamExists(stream.clone()));
        }
        streams.insert(stream.clone(), events);
        Ok(())
    }
}

/// Latest snapshot per `(aggregate_type, aggregate_id)`.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, String), Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn get(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots
            .get(&(aggregate_type.to_owned(), aggregate_id.to_owned()))
            .cloned())
    }

    fn save(&self, snapshots: Vec<Snapshot>) -> Result<(), StoreError> {
        let mut stored = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        for snapshot in snapshots {
            let key = (snapshot.aggregate_type.clone(), snapshot.aggregate_id.clone());
            stored.insert(key, snapshot);
        }
        Ok(())
    }
}
