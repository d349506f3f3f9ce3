//! Per-dispatcher cache of aggregate definitions, keyed by command name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::aggregate::AggregateDefinition;
use crate::command::CommandMap;
use crate::error::DispatchError;

/// Definition instances keyed by command name.
type DefinitionMap = HashMap<String, Arc<dyn AggregateDefinition>>;

/// Lazily built, never evicted map from command name to the aggregate
/// definition serving it.
///
/// The first lookup for a command name builds the definition through the
/// command map's factory; every later lookup returns the same instance.
/// Concurrent first lookups may each build a candidate, but only the first
/// one inserted is retained and returned to all callers.
#[derive(Default)]
pub struct DefinitionCache {
    definitions: RwLock<DefinitionMap>,
}

// Manual `Debug` because `dyn AggregateDefinition` is not `Debug`.
impl std::fmt::Debug for DefinitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionCache")
            .field("len", &self.len())
            .finish()
    }
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the definition for `command_name`, building it on first use.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownCommand`] if `command_map` has no route for
    /// `command_name`.
    pub fn get(
        &self,
        command_name: &str,
        command_map: &CommandMap,
    ) -> Result<Arc<dyn AggregateDefinition>, DispatchError> {
        // Fast path: shared lock.
        {
            // Definitions are immutable once inserted, so a poisoned lock
            // still holds a consistent map.
            let definitions = self.definitions.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(definition) = definitions.get(command_name) {
                return Ok(Arc::clone(definition));
            }
        }

        let route = command_map
            .get(command_name)
            .ok_or_else(|| DispatchError::UnknownCommand(command_name.to_owned()))?;

        tracing::debug!(command = %command_name, "building aggregate definition");
        let candidate = route.build_definition();

        // Slow path: a racing caller may have inserted first; keep theirs.
        let mut definitions = self.definitions.write().unwrap_or_else(PoisonError::into_inner);
        let retained = definitions
            .entry(command_name.to_owned())
            .or_insert(candidate);
        Ok(Arc::clone(retained))
    }

    /// Number of cached definitions.
    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
