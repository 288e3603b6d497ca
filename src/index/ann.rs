use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

use crate::error::{MagpieError, Result};
use crate::types::{ContentCategory, ScoredRecord};

/// Seed entry added to every fresh index so the HNSW structure is never
/// constructed without a vector. Excluded from counts and search results.
pub(crate) const BOOTSTRAP_DOC_ID: &str = "__seed__";

/// File holding the serialized HNSW structure inside an index directory.
pub const INDEX_FILE: &str = "index.usearch";
/// File holding the id map and entry metadata.
pub const META_FILE: &str = "meta.json";

/// HNSW index over embedded records, with string doc-id mapping and a
/// category tag per entry for filtered search.
pub struct AnnIndex {
    inner: Index,
    doc_to_key: HashMap<String, u64>,
    key_to_doc: HashMap<u64, String>,
    categories: HashMap<String, Option<ContentCategory>>,
    next_key: u64,
    dimensions: usize,
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("doc_to_key", &self.doc_to_key)
            .field("key_to_doc", &self.key_to_doc)
            .field("categories", &self.categories)
            .field("next_key", &self.next_key)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct AnnMeta {
    doc_to_key: HashMap<String, u64>,
    key_to_doc: HashMap<u64, String>,
    categories: HashMap<String, Option<ContentCategory>>,
    next_key: u64,
    dimensions: usize,
}

fn hnsw_options(dimensions: usize) -> IndexOptions {
    IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: 0,
        expansion_add: 0,
        expansion_search: 0,
        multi: false,
    }
}

impl AnnIndex {
    /// Create an empty index, seeded with the bootstrap placeholder.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(MagpieError::Config(
                "embedding dimensions must be positive".into(),
            ));
        }
        let inner =
            Index::new(&hnsw_options(dimensions)).map_err(|e| MagpieError::Ann(e.to_string()))?;
        let mut idx = AnnIndex {
            inner,
            doc_to_key: HashMap::new(),
            key_to_doc: HashMap::new(),
            categories: HashMap::new(),
            next_key: 0,
            dimensions,
        };
        let mut seed = vec![0.0f32; dimensions];
        seed[0] = 1.0;
        idx.insert_raw(BOOTSTRAP_DOC_ID, None, &seed)?;
        Ok(idx)
    }

    fn insert_raw(
        &mut self,
        doc_id: &str,
        category: Option<ContentCategory>,
        vector: &[f32],
    ) -> Result<()> {
        if let Some(&key) = self.doc_to_key.get(doc_id) {
            // Replace: drop the old vector, re-add under the same key.
            self.inner
                .remove(key)
                .map_err(|e| MagpieError::Ann(e.to_string()))?;
            self.inner
                .add(key, vector)
                .map_err(|e| MagpieError::Ann(e.to_string()))?;
        } else {
            let key = self.next_key;
            self.next_key += 1;
            self.inner
                .reserve(self.doc_to_key.len() + 1)
                .map_err(|e| MagpieError::Ann(e.to_string()))?;
            self.inner
                .add(key, vector)
                .map_err(|e| MagpieError::Ann(e.to_string()))?;
            self.doc_to_key.insert(doc_id.to_owned(), key);
            self.key_to_doc.insert(key, doc_id.to_owned());
        }
        self.categories.insert(doc_id.to_owned(), category);
        Ok(())
    }

    pub fn add(&mut self, doc_id: &str, category: ContentCategory, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(MagpieError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        self.insert_raw(doc_id, Some(category), vector)
    }

    pub fn remove(&mut self, doc_id: &str) -> Result<()> {
        let key = self
            .doc_to_key
            .get(doc_id)
            .copied()
            .ok_or_else(|| MagpieError::Ann(format!("document not found: {doc_id}")))?;
        self.inner
            .remove(key)
            .map_err(|e| MagpieError::Ann(e.to_string()))?;
        self.doc_to_key.remove(doc_id);
        self.key_to_doc.remove(&key);
        self.categories.remove(doc_id);
        Ok(())
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        doc_id != BOOTSTRAP_DOC_ID && self.doc_to_key.contains_key(doc_id)
    }

    /// Similarity search. Scores are `1 - cosine_distance`; the bootstrap
    /// placeholder never appears in results.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        category: Option<ContentCategory>,
    ) -> Result<Vec<ScoredRecord>> {
        if query.len() != self.dimensions {
            return Err(MagpieError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if self.len() == 0 || k == 0 {
            return Ok(Vec::new());
        }
        // Over-fetch one slot so the placeholder can't crowd out a real hit.
        let matches = self
            .inner
            .search(query, k + 1)
            .map_err(|e| MagpieError::Ann(e.to_string()))?;
        let mut results = Vec::with_capacity(k);
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(doc_id) = self.key_to_doc.get(key) else {
                continue;
            };
            if doc_id == BOOTSTRAP_DOC_ID {
                continue;
            }
            if let Some(want) = category {
                match self.categories.get(doc_id) {
                    Some(Some(c)) if *c == want => {}
                    _ => continue,
                }
            }
            results.push(ScoredRecord {
                doc_id: doc_id.clone(),
                score: 1.0 - *distance,
            });
            if results.len() == k {
                break;
            }
        }
        Ok(results)
    }

    /// Exact document count, excluding the bootstrap placeholder.
    pub fn len(&self) -> usize {
        let seeded = self.doc_to_key.contains_key(BOOTSTRAP_DOC_ID) as usize;
        self.doc_to_key.len() - seeded
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }

    /// Write the serialized structure and metadata into `dir`.
    /// Plain file writes — the atomic protocol lives in [`super::persistence`].
    pub fn write_files(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let index_path = dir.join(INDEX_FILE);
        let index_path_str = index_path
            .to_str()
            .ok_or_else(|| MagpieError::InvalidPath(format!("{}", index_path.display())))?;
        self.inner
            .save(index_path_str)
            .map_err(|e| MagpieError::Ann(e.to_string()))?;

        let meta = AnnMeta {
            doc_to_key: self.doc_to_key.clone(),
            key_to_doc: self.key_to_doc.clone(),
            categories: self.categories.clone(),
            next_key: self.next_key,
            dimensions: self.dimensions,
        };
        std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    /// Read an index previously written with [`AnnIndex::write_files`].
    pub fn read_files(dir: &Path) -> Result<Self> {
        let meta_json = std::fs::read_to_string(dir.join(META_FILE))?;
        let meta: AnnMeta = serde_json::from_str(&meta_json)?;

        let inner = Index::new(&hnsw_options(meta.dimensions))
            .map_err(|e| MagpieError::Ann(e.to_string()))?;
        inner
            .reserve(meta.doc_to_key.len().max(1))
            .map_err(|e| MagpieError::Ann(e.to_string()))?;

        let index_path = dir.join(INDEX_FILE);
        let index_path_str = index_path
            .to_str()
            .ok_or_else(|| MagpieError::InvalidPath(format!("{}", index_path.display())))?;
        if index_path.exists() && std::fs::metadata(&index_path)?.len() > 0 {
            inner
                .load(index_path_str)
                .map_err(|e| MagpieError::Ann(e.to_string()))?;
        }

        Ok(AnnIndex {
            inner,
            doc_to_key: meta.doc_to_key,
            key_to_doc: meta.key_to_doc,
            categories: meta.categories,
            next_key: meta.next_key,
            dimensions: meta.dimensions,
        })
    }
}
