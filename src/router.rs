//! Migration routing between the source-of-truth search path and the ANN
//! index: store-only, dual-write, shadow-read, or ANN-primary-with-fallback.
//!
//! The mode lives in a single locked slot and is read once per operation, so
//! a live flag flip never changes behavior mid-operation.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RoutingMode, VectorStoreConfig};
use crate::error::Result;
use crate::index::store::{IndexStore, SearchOptions};
use crate::store::DocumentStore;
use crate::types::{resolve_scope, ContentCategory, Scope, ScoredRecord, SourceDocument};

/// Jaccard similarity of two id sets. Two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// One shadow-read comparison. Kept in a bounded ring buffer, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub query: String,
    pub scope: Scope,
    pub store_ids: Vec<String>,
    pub ann_ids: Vec<String>,
    pub jaccard: f64,
    pub overlap: usize,
    pub store_only: usize,
    pub ann_only: usize,
    pub acceptable: bool,
    pub compared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceStats {
    pub comparisons: usize,
    pub mean_jaccard: f64,
    pub pct_acceptable: f64,
    pub last_compared_at: Option<DateTime<Utc>>,
}

pub struct StrategyRouter {
    mode: RwLock<RoutingMode>,
    store: Arc<dyn DocumentStore>,
    index_store: Arc<IndexStore>,
    divergence_threshold: f64,
    history_cap: usize,
    history: Mutex<VecDeque<DivergenceRecord>>,
}

impl StrategyRouter {
    pub fn new(
        config: &VectorStoreConfig,
        store: Arc<dyn DocumentStore>,
        index_store: Arc<IndexStore>,
    ) -> Arc<Self> {
        Arc::new(StrategyRouter {
            mode: RwLock::new(config.routing_mode),
            store,
            index_store,
            divergence_threshold: config.divergence_threshold,
            history_cap: config.divergence_history_cap.max(1),
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn mode(&self) -> RoutingMode {
        *self.mode.read().expect("mode slot poisoned")
    }

    /// Switch phases at runtime. Operations already in flight finish under
    /// the mode they started with.
    pub fn set_mode(&self, mode: RoutingMode) {
        let mut slot = self.mode.write().expect("mode slot poisoned");
        let previous = *slot;
        *slot = mode;
        drop(slot);
        if previous != mode {
            tracing::info!("[ROUTER] mode switched {:?} -> {:?}", previous, mode);
            if previous == RoutingMode::AnnPrimary {
                // The store path becomes user-facing again.
                tracing::info!("[ROUTER] source-of-truth search path re-activated");
            }
        }
    }

    // ── writes ──────────────────────────────────────────────────────────

    /// Route a write according to the current phase. In dual-write phases
    /// the source of truth is written first, so it stays authoritative under
    /// partial failure.
    pub async fn add(
        &self,
        docs: Vec<SourceDocument>,
        category: ContentCategory,
        tenant_id: Option<&str>,
    ) -> Result<Scope> {
        // Pairing invariant is enforced before either store is touched.
        let scope = resolve_scope(category, tenant_id)?;
        match self.mode() {
            RoutingMode::StoreOnly => {
                self.store.insert(&docs).await?;
            }
            RoutingMode::DualWrite | RoutingMode::ShadowRead => {
                self.store.insert(&docs).await?;
                self.enqueue_for_index(docs, category, tenant_id)?;
            }
            RoutingMode::AnnPrimary => {
                self.enqueue_for_index(docs, category, tenant_id)?;
            }
        }
        Ok(scope)
    }

    fn enqueue_for_index(
        &self,
        docs: Vec<SourceDocument>,
        category: ContentCategory,
        tenant_id: Option<&str>,
    ) -> Result<()> {
        let records = docs.iter().map(SourceDocument::to_embedded).collect();
        self.index_store.add_documents(records, category, tenant_id)?;
        Ok(())
    }

    // ── reads ───────────────────────────────────────────────────────────

    /// Route a search. Callers always get *a* ranked result set: shadow
    /// reads return the store result, and ANN-primary degrades to the store
    /// on any ANN failure.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        tenant_id: Option<&str>,
        category: Option<ContentCategory>,
    ) -> Result<Vec<ScoredRecord>> {
        let scope = match tenant_id {
            Some(id) => Scope::Tenant(id.to_string()),
            None => Scope::Global,
        };
        let opts = SearchOptions {
            k,
            tenant_id: tenant_id.map(String::from),
            category,
            score_threshold: None,
        };
        match self.mode() {
            RoutingMode::StoreOnly | RoutingMode::DualWrite => {
                self.store.search_text(query, k, &scope).await
            }
            RoutingMode::ShadowRead => {
                let (store_result, ann_result) = tokio::join!(
                    self.store.search_text(query, k, &scope),
                    self.index_store.search(query, &opts)
                );
                let store_hits = store_result?;
                match ann_result {
                    Ok(ann_hits) => {
                        self.record_divergence(query, &scope, &store_hits, &ann_hits)
                    }
                    Err(e) => {
                        tracing::warn!("[ROUTER {}] shadow read failed: {}", scope, e);
                    }
                }
                Ok(store_hits)
            }
            RoutingMode::AnnPrimary => match self.index_store.search(query, &opts).await {
                Ok(hits) => Ok(hits),
                Err(e) => {
                    tracing::warn!(
                        "[ROUTER {}] ANN search failed ({}), falling back to store",
                        scope,
                        e
                    );
                    self.store.search_text(query, k, &scope).await
                }
            },
        }
    }

    // ── divergence metrics ──────────────────────────────────────────────

    fn record_divergence(
        &self,
        query: &str,
        scope: &Scope,
        store_hits: &[ScoredRecord],
        ann_hits: &[ScoredRecord],
    ) {
        let store_ids: HashSet<String> = store_hits.iter().map(|r| r.doc_id.clone()).collect();
        let ann_ids: HashSet<String> = ann_hits.iter().map(|r| r.doc_id.clone()).collect();
        let similarity = jaccard(&store_ids, &ann_ids);
        let overlap = store_ids.intersection(&ann_ids).count();
        let record = DivergenceRecord {
            query: query.to_string(),
            scope: scope.clone(),
            store_ids: store_ids.iter().cloned().collect(),
            ann_ids: ann_ids.iter().cloned().collect(),
            jaccard: similarity,
            overlap,
            store_only: store_ids.len() - overlap,
            ann_only: ann_ids.len() - overlap,
            acceptable: similarity >= self.divergence_threshold,
            compared_at: Utc::now(),
        };
        if !record.acceptable {
            tracing::warn!(
                "[ROUTER {}] divergent shadow read (jaccard {:.3}) for query '{}'",
                scope,
                similarity,
                query
            );
        }
        let mut history = self.history.lock().expect("divergence history poisoned");
        if history.len() == self.history_cap {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn divergence_stats(&self) -> DivergenceStats {
        let history = self.history.lock().expect("divergence history poisoned");
        if history.is_empty() {
            return DivergenceStats {
                comparisons: 0,
                mean_jaccard: 0.0,
                pct_acceptable: 0.0,
                last_compared_at: None,
            };
        }
        let n = history.len();
        let mean = history.iter().map(|r| r.jaccard).sum::<f64>() / n as f64;
        let acceptable = history.iter().filter(|r| r.acceptable).count();
        DivergenceStats {
            comparisons: n,
            mean_jaccard: mean,
            pct_acceptable: acceptable as f64 / n as f64 * 100.0,
            last_compared_at: history.back().map(|r| r.compared_at),
        }
    }

    /// Most recent comparisons, oldest first (test and debug hook).
    pub fn divergence_history(&self) -> Vec<DivergenceRecord> {
        let history = self.history.lock().expect("divergence history poisoned");
        history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use crate::index::write_queue::{create_write_queue, BatchApplyFn, WriteQueueOptions};
    use crate::store::MemoryDocumentStore;
    use crate::types::EmbeddedRecord;

    const DIMS: usize = 32;

    fn doc(id: &str, category: ContentCategory, tenant: Option<&str>, text: &str) -> SourceDocument {
        SourceDocument {
            id: id.into(),
            category,
            tenant_id: tenant.map(String::from),
            text: text.into(),
            chunk_index: 0,
            content_hash: format!("h-{id}"),
        }
    }

    struct Rig {
        router: Arc<StrategyRouter>,
        store: Arc<MemoryDocumentStore>,
        index_store: Arc<IndexStore>,
        queue: crate::index::write_queue::WriteQueueHandle,
        _tmp: tempfile::TempDir,
    }

    fn rig(mode: RoutingMode) -> Rig {
        rig_with(mode, Embedder::deterministic(DIMS))
    }

    fn rig_with(mode: RoutingMode, embedder: Embedder) -> Rig {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = VectorStoreConfig {
            index_root: tmp.path().to_path_buf(),
            embedding_dimensions: DIMS,
            routing_mode: mode,
            divergence_history_cap: 4,
            ..Default::default()
        };
        let store = Arc::new(MemoryDocumentStore::new());
        let index_store = IndexStore::new(&config, Arc::new(embedder));
        let apply_target = Arc::clone(&index_store);
        let apply: BatchApplyFn = Arc::new(move |scope, records: Vec<EmbeddedRecord>| {
            let target = Arc::clone(&apply_target);
            Box::pin(async move { target.apply_batch(&scope, records).await })
        });
        let (queue, _task) = create_write_queue(WriteQueueOptions::from_config(&config), apply);
        index_store.attach_write_queue(queue.clone());
        let router = StrategyRouter::new(
            &config,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&index_store),
        );
        Rig {
            router,
            store,
            index_store,
            queue,
            _tmp: tmp,
        }
    }

    // ── jaccard ─────────────────────────────────────────────────────────

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn jaccard_identical_sets() {
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["a", "b"])), 1.0);
    }

    #[test]
    fn jaccard_disjoint_sets() {
        assert_eq!(jaccard(&set(&["a"]), &set(&["b"])), 0.0);
    }

    #[test]
    fn jaccard_both_empty_is_one() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        // |∩| = 2, |∪| = 4
        let j = jaccard(&set(&["a", "b", "c"]), &set(&["b", "c", "d"]));
        assert!((j - 0.5).abs() < f64::EPSILON);
    }

    // ── divergence threshold boundary ───────────────────────────────────

    #[tokio::test]
    async fn acceptability_boundary_at_exactly_0_7() {
        let r = rig(RoutingMode::ShadowRead);
        // 7 shared ids, 3 extra on each side split 2/1: |∩|=7, |∪|=10 → 0.7.
        let shared: Vec<ScoredRecord> = (0..7)
            .map(|i| ScoredRecord {
                doc_id: format!("s{i}"),
                score: 1.0,
            })
            .collect();
        let mut store_hits = shared.clone();
        store_hits.push(ScoredRecord {
            doc_id: "store-a".into(),
            score: 0.5,
        });
        store_hits.push(ScoredRecord {
            doc_id: "store-b".into(),
            score: 0.4,
        });
        let mut ann_hits = shared;
        ann_hits.push(ScoredRecord {
            doc_id: "ann-a".into(),
            score: 0.5,
        });

        r.router
            .record_divergence("q", &Scope::Global, &store_hits, &ann_hits);
        let rec = &r.router.divergence_history()[0];
        assert!((rec.jaccard - 0.7).abs() < 1e-9);
        assert!(rec.acceptable, "similarity of exactly 0.7 is acceptable");
        assert_eq!(rec.overlap, 7);
        assert_eq!(rec.store_only, 2);
        assert_eq!(rec.ann_only, 1);

        // One fewer shared id: |∩|=6, |∪|=10 → 0.6 < 0.7.
        let store_hits: Vec<ScoredRecord> = (0..8)
            .map(|i| ScoredRecord {
                doc_id: format!("x{i}"),
                score: 1.0,
            })
            .collect();
        let ann_hits: Vec<ScoredRecord> = (2..10)
            .map(|i| ScoredRecord {
                doc_id: format!("x{i}"),
                score: 1.0,
            })
            .collect();
        r.router
            .record_divergence("q2", &Scope::Global, &store_hits, &ann_hits);
        let rec = r.router.divergence_history().pop().unwrap();
        assert!((rec.jaccard - 0.6).abs() < 1e-9);
        assert!(!rec.acceptable);
    }

    #[tokio::test]
    async fn divergence_history_is_bounded() {
        let r = rig(RoutingMode::ShadowRead);
        for i in 0..10 {
            let hits = vec![ScoredRecord {
                doc_id: format!("d{i}"),
                score: 1.0,
            }];
            r.router.record_divergence(&format!("q{i}"), &Scope::Global, &hits, &hits);
        }
        // history_cap is 4 in the rig config.
        let history = r.router.divergence_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].query, "q6");
        let stats = r.router.divergence_stats();
        assert_eq!(stats.comparisons, 4);
        assert_eq!(stats.pct_acceptable, 100.0);
        assert!(stats.last_compared_at.is_some());
    }

    // ── routing modes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn store_only_never_touches_the_index() {
        let r = rig(RoutingMode::StoreOnly);
        r.router
            .add(
                vec![doc("d1", ContentCategory::Prompts, Some("t1"), "only in store")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        r.queue.flush().await.unwrap();

        assert_eq!(r.store.len(), 1);
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("t1".into()))
                .unwrap(),
            0
        );
        let hits = r.router.search("only", 5, Some("t1"), None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn dual_write_lands_in_both_stores() {
        let r = rig(RoutingMode::DualWrite);
        r.router
            .add(
                vec![doc("d1", ContentCategory::Prompts, Some("t1"), "in both places")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        r.queue.flush().await.unwrap();

        assert_eq!(r.store.len(), 1);
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("t1".into()))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn ann_primary_writes_skip_the_store() {
        let r = rig(RoutingMode::AnnPrimary);
        r.router
            .add(
                vec![doc("d1", ContentCategory::Prompts, Some("t1"), "ann only")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        r.queue.flush().await.unwrap();

        assert_eq!(r.store.len(), 0);
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("t1".into()))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn add_validates_pairing_in_every_mode() {
        for mode in [
            RoutingMode::StoreOnly,
            RoutingMode::DualWrite,
            RoutingMode::ShadowRead,
            RoutingMode::AnnPrimary,
        ] {
            let r = rig(mode);
            let err = r
                .router
                .add(
                    vec![doc("d1", ContentCategory::Conversations, None, "no tenant")],
                    ContentCategory::Conversations,
                    None,
                )
                .await
                .unwrap_err();
            assert!(
                matches!(err, crate::error::MagpieError::ScopeMismatch(_)),
                "mode {mode:?} must reject the pairing"
            );
            assert_eq!(r.store.len(), 0, "mode {mode:?} wrote before validating");
        }
    }

    #[tokio::test]
    async fn shadow_read_returns_store_results_and_records_divergence() {
        let r = rig(RoutingMode::ShadowRead);
        r.router
            .add(
                vec![doc("d1", ContentCategory::Prompts, Some("t1"), "shadow target")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        r.queue.flush().await.unwrap();

        let hits = r.router.search("shadow", 5, Some("t1"), None).await.unwrap();
        // The caller sees the store's ranking (text match), not ANN scores.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d1");
        assert_eq!(r.router.divergence_stats().comparisons, 1);
    }

    #[tokio::test]
    async fn ann_primary_falls_back_to_store_on_failure() {
        // Embedder pointing at a closed port: every ANN search fails.
        let r = rig_with(
            RoutingMode::AnnPrimary,
            Embedder::rest("http://127.0.0.1:1/embed", "m", DIMS),
        );
        r.store
            .insert(&[doc("d1", ContentCategory::Prompts, Some("t1"), "fallback hit")])
            .await
            .unwrap();

        let hits = r.router.search("fallback", 5, Some("t1"), None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d1");
    }

    #[tokio::test]
    async fn mode_switch_is_live() {
        let r = rig(RoutingMode::StoreOnly);
        r.router
            .add(
                vec![doc("d1", ContentCategory::Prompts, Some("t1"), "switch test")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("t1".into()))
                .unwrap(),
            0
        );

        r.router.set_mode(RoutingMode::DualWrite);
        assert_eq!(r.router.mode(), RoutingMode::DualWrite);
        r.router
            .add(
                vec![doc("d2", ContentCategory::Prompts, Some("t1"), "after switch")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .await
            .unwrap();
        r.queue.flush().await.unwrap();
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("t1".into()))
                .unwrap(),
            1
        );
    }
}
