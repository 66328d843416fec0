//! In-memory vector store with named collections and brute-force cosine search.
//!
//! Collections are created lazily on first use and hold insertion-ordered
//! entries of a JSON payload plus the embedding extracted from a designated
//! vector field. Queries score every entry (no approximate index) with a
//! size-bounded heap, so a top-k search is O(n log k) over a snapshot of the
//! collection taken under a short lock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::errors::AmaError;

/// Payload field holding the embedding array.
pub const DEFAULT_VECTOR_FIELD: &str = "embedding";

#[derive(Debug)]
struct StoredEntry {
    key: u64,
    payload: Value,
    vector: Vec<f32>,
}

/// One scored match from [`Collection::query`].
#[derive(Debug, Clone)]
pub struct SimilarityResult {
    pub key: u64,
    pub payload: Value,
    pub score: f32,
}

#[derive(Default)]
struct CollectionInner {
    entries: Vec<Arc<StoredEntry>>,
    next_key: u64,
}

/// A named set of vector entries. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Collection {
    name: String,
    vector_field: String,
    inner: Arc<RwLock<CollectionInner>>,
}

/// Registry of named collections sharing one vector-field convention.
pub struct VectorStore {
    vector_field: String,
    collections: RwLock<HashMap<String, Collection>>,
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorStore {
    pub fn new() -> Self {
        Self::with_vector_field(DEFAULT_VECTOR_FIELD)
    }

    pub fn with_vector_field(vector_field: impl Into<String>) -> Self {
        Self {
            vector_field: vector_field.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Get the named collection, creating it empty on first access.
    pub fn collection(&self, name: &str) -> Result<Collection, AmaError> {
        if let Some(existing) = self
            .collections
            .read()
            .map_err(|_| lock_poisoned())?
            .get(name)
        {
            return Ok(existing.clone());
        }
        let mut map = self.collections.write().map_err(|_| lock_poisoned())?;
        let collection = map.entry(name.to_string()).or_insert_with(|| {
            debug!(collection = name, "creating collection");
            Collection {
                name: name.to_string(),
                vector_field: self.vector_field.clone(),
                inner: Arc::new(RwLock::new(CollectionInner {
                    entries: Vec::new(),
                    next_key: 1,
                })),
            }
        });
        Ok(collection.clone())
    }
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a payload, returning the store-assigned key.
    ///
    /// The designated vector field must hold a non-empty array of finite
    /// numbers; otherwise the store is left unchanged.
    pub fn insert(&self, payload: Value) -> Result<u64, AmaError> {
        let vector = extract_vector(&payload, &self.vector_field)?;
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let key = inner.next_key;
        inner.next_key += 1;
        inner.entries.push(Arc::new(StoredEntry {
            key,
            payload,
            vector,
        }));
        Ok(key)
    }

    /// Replace the payload stored under `key`, keeping its scan position.
    pub fn update(&self, key: u64, payload: Value) -> Result<(), AmaError> {
        let vector = extract_vector(&payload, &self.vector_field)?;
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let slot = inner
            .entries
            .iter_mut()
            .find(|e| e.key == key)
            .ok_or_else(|| AmaError::Validation(format!("no entry with key {}", key)))?;
        *slot = Arc::new(StoredEntry {
            key,
            payload,
            vector,
        });
        Ok(())
    }

    pub fn delete(&self, key: u64) -> Result<(), AmaError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let idx = inner
            .entries
            .iter()
            .position(|e| e.key == key)
            .ok_or_else(|| AmaError::Validation(format!("no entry with key {}", key)))?;
        inner.entries.remove(idx);
        Ok(())
    }

    pub fn count(&self) -> Result<usize, AmaError> {
        Ok(self.inner.read().map_err(|_| lock_poisoned())?.entries.len())
    }

    /// Top-`limit` entries by cosine similarity to `query_vector`, best first.
    ///
    /// Entries whose vector length differs from the query are skipped. A zero
    /// magnitude on either side scores -1.0 so it ranks last instead of
    /// producing NaN. Equal scores keep scan order, earlier entry first.
    pub fn query(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SimilarityResult>, AmaError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Snapshot under a short lock; the scan itself is lock-free.
        let snapshot: Vec<Arc<StoredEntry>> = self
            .inner
            .read()
            .map_err(|_| lock_poisoned())?
            .entries
            .clone();

        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(limit + 1);
        for (index, entry) in snapshot.iter().enumerate() {
            if entry.vector.len() != query_vector.len() {
                continue;
            }
            let candidate = Candidate {
                score: cosine_similarity(query_vector, &entry.vector),
                index,
                entry: Arc::clone(entry),
            };
            if heap.len() < limit {
                heap.push(Reverse(candidate));
            } else if heap
                .peek()
                .map(|worst| candidate > worst.0)
                .unwrap_or(false)
            {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(c)| SimilarityResult {
                key: c.entry.key,
                payload: c.entry.payload.clone(),
                score: c.score,
            })
            .collect())
    }
}

struct Candidate {
    score: f32,
    index: usize,
    entry: Arc<StoredEntry>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Higher score wins; on ties the earlier scan index wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return -1.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn extract_vector(payload: &Value, field: &str) -> Result<Vec<f32>, AmaError> {
    let raw = payload
        .get(field)
        .ok_or_else(|| AmaError::Validation(format!("payload is missing vector field '{}'", field)))?;
    let array = raw
        .as_array()
        .ok_or_else(|| AmaError::Validation(format!("vector field '{}' is not an array", field)))?;
    if array.is_empty() {
        return Err(AmaError::Validation(format!(
            "vector field '{}' is empty",
            field
        )));
    }
    let mut vector = Vec::with_capacity(array.len());
    for element in array {
        let value = element.as_f64().ok_or_else(|| {
            AmaError::Validation(format!("vector field '{}' holds a non-numeric element", field))
        })?;
        if !value.is_finite() {
            return Err(AmaError::Validation(format!(
                "vector field '{}' holds a non-finite element",
                field
            )));
        }
        vector.push(value as f32);
    }
    Ok(vector)
}

fn lock_poisoned() -> AmaError {
    AmaError::TransientIo("vector store lock poisoned".to_string())
}
