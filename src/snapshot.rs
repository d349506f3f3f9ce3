//! Snapshot contract for skipping full event replay.
//!
//! A snapshot records an aggregate's state together with the version it
//! was taken at, so replay can resume from `last_version + 1`.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::aggregate::State;
use crate::error::StoreError;

/// A point-in-time copy of an aggregate's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate type, e.g. `"user"`.
    pub aggregate_type: String,
    /// Aggregate instance id.
    pub aggregate_id: String,
    /// State at the time of the snapshot.
    pub state: State,
    /// Aggregate version folded into `state`.
    pub last_version: u64,
    /// When the snapshot was taken.
    pub created_at: SystemTime,
}

impl Snapshot {
    /// Snapshot of `state` at `last_version`, stamped with the current time.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        state: State,
        last_version: u64,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            state,
            last_version,
            created_at: SystemTime::now(),
        }
    }
}

/// Keyed storage for the latest snapshot of each aggregate.
pub trait SnapshotStore: Send + Sync {
    /// The latest snapshot for `(aggregate_type, aggregate_id)`, if any.
    ///
    /// A missing snapshot is `Ok(None)`, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only when the store itself fails.
    fn get(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Store `snapshots`, replacing earlier ones for the same aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write is rejected.
    fn save(&self, snapshots: Vec<Snapshot>) -> Result<(), StoreError>;
}

/// Produces the snapshot store a dispatch reads from.
pub type SnapshotStoreFactory =
    Arc<dyn Fn() -> Result<Arc<dyn SnapshotStore>, StoreError> + Send + Sync>;

/// Wrap an existing snapshot store in a factory that always hands it out.
pub fn shared_snapshot_store(store: Arc<dyn SnapshotStore>) -> SnapshotStoreFactory {
    Arc::new(move || Ok(Arc::clone(&store)))
}
