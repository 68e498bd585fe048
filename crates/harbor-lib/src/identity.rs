//! Known relay identities
//!
//! The engine records every bottle it learns about, from bootstrap peers,
//! publish requests, bottle updates and docking signals. Implement
//! [`IdentityStore`] to keep them somewhere other than memory.

use crate::error::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use harbor_tinker::Bottle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Storage for relay identities
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, relay_id: &str) -> Result<Option<Bottle>, EngineError>;

    /// Save a bottle, replacing an older one for the same relay
    async fn put(&self, bottle: Bottle) -> Result<(), EngineError>;

    /// Every stored bottle
    async fn scan(&self) -> Result<Vec<Bottle>, EngineError>;
}

/// Keeps identities in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityStore {
    bottles: Arc<Mutex<HashMap<String, Bottle>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bottles<T>(&self, f: impl FnOnce(&mut HashMap<String, Bottle>) -> T) -> Result<T, EngineError> {
        let mut bottles = self
            .bottles
            .lock()
            .map_err(|_| EngineError::Store("identity table poisoned".into()))?;
        Ok(f(&mut bottles))
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get(&self, relay_id: &str) -> Result<Option<Bottle>, EngineError> {
        self.with_bottles(|bottles| bottles.get(relay_id).cloned())
    }

    async fn put(&self, bottle: Bottle) -> Result<(), EngineError> {
        self.with_bottles(|bottles| {
            let newer = bottles
                .get(&bottle.id)
                .map_or(true, |known| known.published_at <= bottle.published_at);
            if newer {
                bottles.insert(bottle.id.clone(), bottle);
            }
        })
    }

    async fn scan(&self) -> Result<Vec<Bottle>, EngineError> {
        self.with_bottles(|bottles| {
            let mut all: Vec<Bottle> = bottles.values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            all
        })
    }
}

/// Check that a bottle can be used to reach its relay
pub fn validate_bottle(bottle: &Bottle) -> Result<(), EngineError> {
    if bottle.id.is_empty() {
        return Err(EngineError::Store("bottle without relay id".into()));
    }
    if bottle.select_exchange_key(Utc::now()).is_none() {
        return Err(EngineError::Store(format!(
            "bottle for {} has no valid exchange key",
            bottle.id
        )));
    }
    Ok(())
}
