//! Match session store
//!
//! Maps a match key to an immutable tag -> points table. Tables are created
//! once and only read afterwards; readers clone the `Arc` and release the
//! lock immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

/// Immutable tag -> points table of one match
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchTable {
    points: HashMap<String, i64>,
}

impl MatchTable {
    pub fn new(points: HashMap<String, i64>) -> Self {
        Self { points }
    }

    /// Point value of a tag, if the tag belongs to this match
    pub fn points_for(&self, tag_id: &str) -> Option<i64> {
        self.points.get(tag_id).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sorted copy for responses
    pub fn to_mapping(&self) -> BTreeMap<String, i64> {
        self.points.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// Match store errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Match key already exists: {0}")]
    AlreadyExists(String),
}

/// Tag lookup failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Invalid or expired match key")]
    UnknownMatch,

    #[error("Unknown tag_id")]
    UnknownTag,
}

/// In-memory match registry
#[derive(Debug, Default)]
pub struct MatchStore {
    matches: RwLock<HashMap<String, Arc<MatchTable>>>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new match; an existing key is never overwritten
    pub async fn create(
        &self,
        match_key: &str,
        table: MatchTable,
    ) -> Result<Arc<MatchTable>, StoreError> {
        let mut matches = self.matches.write().await;
        if matches.contains_key(match_key) {
            return Err(StoreError::AlreadyExists(match_key.to_string()));
        }
        let table = Arc::new(table);
        matches.insert(match_key.to_string(), Arc::clone(&table));
        tracing::info!(
            match_key,
            tag_count = table.len(),
            active_matches = matches.len(),
            "Match created"
        );
        Ok(table)
    }

    pub async fn get(&self, match_key: &str) -> Option<Arc<MatchTable>> {
        self.matches.read().await.get(match_key).cloned()
    }

    pub async fn contains(&self, match_key: &str) -> bool {
        self.matches.read().await.contains_key(match_key)
    }

    /// Points of `tag_id` in match `match_key`
    pub async fn decode(&self, match_key: &str, tag_id: &str) -> Result<i64, LookupError> {
        let table = self.get(match_key).await.ok_or(LookupError::UnknownMatch)?;
        table.points_for(tag_id).ok_or(LookupError::UnknownTag)
    }
}
