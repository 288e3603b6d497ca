//! Source-of-truth document store interface.
//!
//! The durable store is an external collaborator: the subsystem only needs
//! paginated batch reads, count queries, appends, and the legacy text-search
//! path used before (and alongside) the ANN index. The ANN index is always
//! reconstructible from whatever implements [`DocumentStore`].

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::Result;
use crate::types::{Scope, ScoredRecord, SourceDocument};

/// Narrow interface onto the durable document collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Append records. Existing ids are overwritten (upsert semantics).
    async fn insert(&self, docs: &[SourceDocument]) -> Result<()>;

    /// Paginated batch read of the documents eligible for `scope`
    /// (skip/limit semantics, stable order between calls).
    async fn fetch_batch(&self, scope: &Scope, skip: u64, limit: u64)
        -> Result<Vec<SourceDocument>>;

    /// Count of documents eligible for `scope`.
    async fn count(&self, scope: &Scope) -> Result<u64>;

    /// Legacy search path: ranked text match against the store itself.
    async fn search_text(&self, query: &str, k: usize, scope: &Scope)
        -> Result<Vec<ScoredRecord>>;

    /// Distinct tenant ids with any documents. Drives per-tenant validation.
    async fn tenant_ids(&self) -> Result<Vec<String>>;
}

fn eligible(doc: &SourceDocument, scope: &Scope) -> bool {
    match scope {
        Scope::Global => !doc.category.is_tenant_scoped(),
        Scope::Tenant(id) => {
            doc.category.is_tenant_scoped() && doc.tenant_id.as_deref() == Some(id.as_str())
        }
    }
}

/// In-memory reference implementation, used in tests and keyless dev runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<Vec<SourceDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total document count regardless of scope (test convenience).
    pub fn len(&self) -> usize {
        self.docs.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, new_docs: &[SourceDocument]) -> Result<()> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        for doc in new_docs {
            if let Some(existing) = docs.iter_mut().find(|d| d.id == doc.id) {
                *existing = doc.clone();
            } else {
                docs.push(doc.clone());
            }
        }
        Ok(())
    }

    async fn fetch_batch(
        &self,
        scope: &Scope,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<SourceDocument>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        Ok(docs
            .iter()
            .filter(|d| eligible(d, scope))
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, scope: &Scope) -> Result<u64> {
        let docs = self.docs.lock().expect("store lock poisoned");
        Ok(docs.iter().filter(|d| eligible(d, scope)).count() as u64)
    }

    async fn search_text(
        &self,
        query: &str,
        k: usize,
        scope: &Scope,
    ) -> Result<Vec<ScoredRecord>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let mut hits: Vec<ScoredRecord> = docs
            .iter()
            .filter(|d| eligible(d, scope))
            .filter_map(|d| {
                let text = d.text.to_lowercase();
                let matched = terms.iter().filter(|t| text.contains(t.as_str())).count();
                if matched == 0 || terms.is_empty() {
                    None
                } else {
                    Some(ScoredRecord {
                        doc_id: d.id.clone(),
                        score: matched as f32 / terms.len() as f32,
                    })
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn tenant_ids(&self) -> Result<Vec<String>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        let mut ids: Vec<String> = docs.iter().filter_map(|d| d.tenant_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentCategory;

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

    #[tokio::test]
    async fn insert_and_count_by_scope() {
        let store = MemoryDocumentStore::new();
        store
            .insert(&[
                doc("g1", ContentCategory::Guides, None, "getting started"),
                doc("t1", ContentCategory::Prompts, Some("acme"), "summarize costs"),
                doc("t2", ContentCategory::Prompts, Some("other"), "weekly digest"),
            ])
            .await
            .unwrap();

        assert_eq!(store.count(&Scope::Global).await.unwrap(), 1);
        assert_eq!(store.count(&Scope::Tenant("acme".into())).await.unwrap(), 1);
        assert_eq!(store.count(&Scope::Tenant("other".into())).await.unwrap(), 1);
        assert_eq!(store.count(&Scope::Tenant("ghost".into())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_upserts_on_same_id() {
        let store = MemoryDocumentStore::new();
        store
            .insert(&[doc("a", ContentCategory::Guides, None, "v1")])
            .await
            .unwrap();
        store
            .insert(&[doc("a", ContentCategory::Guides, None, "v2")])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        let batch = store.fetch_batch(&Scope::Global, 0, 10).await.unwrap();
        assert_eq!(batch[0].text, "v2");
    }

    #[tokio::test]
    async fn fetch_batch_paginates_in_stable_order() {
        let store = MemoryDocumentStore::new();
        let docs: Vec<SourceDocument> = (0..7)
            .map(|i| doc(&format!("d{i}"), ContentCategory::Guides, None, "text"))
            .collect();
        store.insert(&docs).await.unwrap();

        let page1 = store.fetch_batch(&Scope::Global, 0, 3).await.unwrap();
        let page2 = store.fetch_batch(&Scope::Global, 3, 3).await.unwrap();
        let page3 = store.fetch_batch(&Scope::Global, 6, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page2.len(), 3);
        assert_eq!(page3.len(), 1);
        let ids: Vec<&str> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d0", "d1", "d2", "d3", "d4", "d5", "d6"]);
    }

    #[tokio::test]
    async fn search_text_scores_by_term_overlap() {
        let store = MemoryDocumentStore::new();
        store
            .insert(&[
                doc("a", ContentCategory::Guides, None, "token pricing for models"),
                doc("b", ContentCategory::Guides, None, "pricing only"),
                doc("c", ContentCategory::Guides, None, "unrelated"),
            ])
            .await
            .unwrap();

        let hits = store
            .search_text("token pricing", 10, &Scope::Global)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_text_respects_scope_partition() {
        let store = MemoryDocumentStore::new();
        store
            .insert(&[
                doc("t1", ContentCategory::Prompts, Some("acme"), "monthly spend"),
                doc("t2", ContentCategory::Prompts, Some("other"), "monthly spend"),
            ])
            .await
            .unwrap();

        let hits = store
            .search_text("monthly", 10, &Scope::Tenant("acme".into()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "t1");
    }

    #[tokio::test]
    async fn tenant_ids_dedup_sorted() {
        let store = MemoryDocumentStore::new();
        store
            .insert(&[
                doc("1", ContentCategory::Prompts, Some("b"), "x"),
                doc("2", ContentCategory::Prompts, Some("a"), "x"),
                doc("3", ContentCategory::Prompts, Some("b"), "x"),
            ])
            .await
            .unwrap();
        assert_eq!(
            store.tenant_ids().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
