//! Retrieval pipeline: chunk a document, embed the chunks into a per-document
//! vector collection, and answer queries with the top-scoring chunk texts.
//!
//! `init` is idempotent: a collection that already holds entries is reused
//! as-is. An interrupted indexing run therefore leaves a short collection
//! behind; that is detected by comparing against the fresh chunk count and
//! logged, not repaired.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::AmaError;
use crate::model::Embedder;
use crate::splitter::TextSplitter;
use crate::vector_store::{Collection, VectorStore};

pub const CHUNK_SIZE: usize = 1024;
pub const CHUNK_OVERLAP: usize = 100;
pub const RETRIEVAL_LIMIT: usize = 3;
pub const CONTEXT_JOINER: &str = "\n\n---\n\n";
const PROGRESS_EVERY: usize = 10;
const EMBEDDING_LRU_CAPACITY: usize = 10_000;

/// Collection name for a document, stable across runs.
pub fn collection_name_for(url: &str) -> String {
    format!("vdb_{}", hex::encode(Sha256::digest(url.as_bytes())))
}

pub struct RagPipeline {
    document_url: String,
    splitter: TextSplitter,
    embedder: Arc<dyn Embedder>,
    collection: Collection,
    embedding_cache: Mutex<LruCache<[u8; 32], Vec<f32>>>,
}

impl RagPipeline {
    pub fn new(
        document_url: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        store: &VectorStore,
    ) -> Result<Self, AmaError> {
        let document_url = document_url.into();
        let collection = store.collection(&collection_name_for(&document_url))?;
        Ok(Self {
            document_url,
            splitter: TextSplitter::new(CHUNK_SIZE, CHUNK_OVERLAP)?,
            embedder,
            collection,
            embedding_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_LRU_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    /// Chunk and embed `text` into the document's collection.
    ///
    /// Returns `true` when indexing actually ran, `false` when an existing
    /// index was reused. `progress` receives human-readable status lines.
    pub async fn init(
        &self,
        text: &str,
        mut progress: impl FnMut(&str),
    ) -> Result<bool, AmaError> {
        progress("Chunking document...");
        let chunks = self.splitter.split_text(text);

        let existing = self.collection.count()?;
        if existing > 0 {
            match self.verify_count(existing, chunks.len()) {
                Ok(()) => {
                    info!(url = %self.document_url, chunks = existing, "reusing existing index")
                }
                // Reused as-is; repairing an interrupted run is out of scope.
                Err(e) => warn!(
                    code = e.error_code(),
                    expected = chunks.len(),
                    "{}", e
                ),
            }
            return Ok(false);
        }

        progress("Generating embeddings (this may take a while)...");
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if i % PROGRESS_EVERY == 0 {
                progress(&format!("Embedding... ({}/{})", i, total));
            }
            let embedding = self.embed_cached(chunk).await?;
            self.collection.insert(json!({
                "documentId": self.document_url,
                "text": chunk,
                "embedding": embedding,
            }))?;
        }
        info!(url = %self.document_url, chunks = total, "document indexed");
        Ok(true)
    }

    /// Embed the question and return the top chunk texts, best match first,
    /// joined by [`CONTEXT_JOINER`]. Empty when nothing is indexed.
    pub async fn retrieve(&self, question: &str) -> Result<String, AmaError> {
        let query_vector = self.embed_cached(question).await?;
        let results = self.collection.query(&query_vector, RETRIEVAL_LIMIT)?;
        let texts: Vec<&str> = results
            .iter()
            .filter_map(|r| r.payload["text"].as_str())
            .collect();
        Ok(texts.join(CONTEXT_JOINER))
    }

    pub fn indexed_chunks(&self) -> Result<usize, AmaError> {
        self.collection.count()
    }

    /// Compare the stored index against a fresh chunking of `text`. A
    /// non-empty collection with the wrong entry count is the footprint of an
    /// indexing run that was interrupted mid-document.
    pub fn check_index(&self, text: &str) -> Result<(), AmaError> {
        let indexed = self.collection.count()?;
        if indexed == 0 {
            return Ok(());
        }
        self.verify_count(indexed, self.splitter.split_text(text).len())
    }

    fn verify_count(&self, indexed: usize, expected: usize) -> Result<(), AmaError> {
        if indexed != expected {
            return Err(AmaError::PartialIndex {
                url: self.document_url.clone(),
                indexed,
            });
        }
        Ok(())
    }

    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>, AmaError> {
        let key: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        {
            let mut cache = self.embedding_cache.lock().map_err(|_| {
                AmaError::TransientIo("embedding cache lock poisoned".to_string())
            })?;
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }
        let embedding = self.embedder.embed(text).await?;
        let mut cache = self
            .embedding_cache
            .lock()
            .map_err(|_| AmaError::TransientIo("embedding cache lock poisoned".to_string()))?;
        cache.put(key, embedding.clone());
        Ok(embedding)
    }
}
