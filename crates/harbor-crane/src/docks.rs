//! Registry of cranes by the relay they lead to

use crate::crane::Crane;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A crane assigned to a relay
#[derive(Debug, Clone)]
pub struct DockEntry {
    pub crane: Arc<Crane>,
    pub assigned_at: DateTime<Utc>,
}

/// Maps relay IDs to the crane currently used to reach them.
///
/// All operations take the same lock; never call in while holding a crane or
/// line lock.
#[derive(Debug, Default)]
pub struct Docks {
    entries: Mutex<HashMap<String, DockEntry>>,
}

impl Docks {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, DockEntry>) -> T) -> T {
        match self.entries.lock() {
            Ok(mut entries) => f(&mut entries),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Assign `crane` to `relay_id`, returning the crane it replaces
    pub fn assign(&self, relay_id: impl Into<String>, crane: Arc<Crane>) -> Option<Arc<Crane>> {
        let relay_id = relay_id.into();
        info!(relay_id = %relay_id, crane_id = %crane.id(), "Crane docked");
        let entry = DockEntry {
            crane,
            assigned_at: Utc::now(),
        };
        self.with_entries(|entries| entries.insert(relay_id, entry))
            .map(|previous| previous.crane)
    }

    pub fn get(&self, relay_id: &str) -> Option<Arc<Crane>> {
        self.with_entries(|entries| entries.get(relay_id).map(|e| e.crane.clone()))
    }

    /// Remove the assignment for `relay_id`
    pub fn retract(&self, relay_id: &str) -> Option<Arc<Crane>> {
        let removed = self.with_entries(|entries| entries.remove(relay_id));
        if removed.is_some() {
            debug!(relay_id, "Crane retracted");
        }
        removed.map(|e| e.crane)
    }

    /// Remove every assignment held by the crane `crane_id`, returning the
    /// relay IDs it was docked under
    pub fn retract_crane(&self, crane_id: &str) -> Vec<String> {
        let removed: Vec<String> = self.with_entries(|entries| {
            let relays: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.crane.id() == crane_id)
                .map(|(relay, _)| relay.clone())
                .collect();
            for relay in &relays {
                entries.remove(relay);
            }
            relays
        });
        if !removed.is_empty() {
            debug!(crane_id, relays = ?removed, "Crane retracted");
        }
        removed
    }

    /// All current assignments
    pub fn snapshot(&self) -> Vec<(String, DockEntry)> {
        self.with_entries(|entries| {
            entries
                .iter()
                .map(|(relay, e)| (relay.clone(), e.clone()))
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
