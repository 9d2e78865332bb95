//! ISR upstream: where page data comes from.
//!
//! The planner needs exactly two things from upstream: every candidate id
//! (to plan eager builds) and one entity by id, which may be absent.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;

mod http;

pub use http::{extract_ids, item_url, HttpDataSource, HttpSourceConfig};

/// Upstream data source for one collection of entities.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// All candidate identifiers, in upstream order.
    async fn fetch_ids(&self) -> Result<Vec<String>>;

    /// One entity by id; `Ok(None)` means upstream says it does not exist.
    async fn fetch_entity(&self, id: &str) -> Result<Option<serde_json::Value>>;
}

/// In-memory source for tests and simulations. Entities can be changed
/// between builds to model upstream edits.
#[derive(Default)]
pub struct StaticDataSource {
    entities: Mutex<Vec<(String, serde_json::Value)>>,
    failing: Mutex<FxHashMap<String, String>>,
    id_fetches: AtomicU64,
    entity_fetches: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

impl StaticDataSource {
    pub fn new() -> Self { Self::default() }

    /// Seed from entities carrying an `id` field (string or number).
    pub fn from_entities(items: Vec<serde_json::Value>) -> Result<Self> {
        let me = Self::new();
        let ids = extract_ids(&serde_json::Value::Array(items.clone()), "id", None)?;
        for (id, item) in ids.into_iter().zip(items) { me.upsert(id, item); }
        Ok(me)
    }

    /// Insert or replace; new ids keep upstream order by arrival.
    pub fn upsert(&self, id: impl Into<String>, entity: serde_json::Value) {
        let id = id.into();
        let mut items = lock(&self.entities);
        match items.iter_mut().find(|(k, _)| *k == id) {
            Some(slot) => slot.1 = entity,
            None => items.push((id, entity)),
        }
    }

    pub fn remove(&self, id: &str) -> Option<serde_json::Value> {
        let mut items = lock(&self.entities);
        let idx = items.iter().position(|(k, _)| k == id)?;
        Some(items.remove(idx).1)
    }

    /// Make fetches of `id` fail with `reason` until cleared.
    pub fn fail_on(&self, id: impl Into<String>, reason: impl Into<String>) {
        lock(&self.failing).insert(id.into(), reason.into());
    }

    pub fn clear_failure(&self, id: &str) { lock(&self.failing).remove(id); }

    pub fn id_fetches(&self) -> u64 { self.id_fetches.load(Ordering::SeqCst) }
    pub fn entity_fetches(&self) -> u64 { self.entity_fetches.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl DataSource for StaticDataSource {
    async fn fetch_ids(&self) -> Result<Vec<String>> {
        self.id_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.entities).iter().map(|(k, _)| k.clone()).collect())
    }

    async fn fetch_entity(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.entity_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = lock(&self.failing).get(id) {
            return Err(anyhow!("fetching {}: {}", id, reason));
        }
        Ok(lock(&self.entities).iter().find(|(k, _)| k == id).map(|(_, v)| v.clone()))
    }
}
