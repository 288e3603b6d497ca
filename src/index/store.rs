//! Index lifecycle: one global index plus per-tenant indices in a bounded
//! cache, loaded lazily and persisted through the atomic save protocol.
//!
//! Mutation goes through the write queue; `apply_batch` is the queue's
//! injected apply step. Searches take the read half of each index lock and
//! run concurrently with queued writes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::config::VectorStoreConfig;
use crate::embedder::Embedder;
use crate::error::{MagpieError, Result};
use crate::index::ann::AnnIndex;
use crate::index::cache::{CachedIndex, TenantCache};
use crate::index::persistence;
use crate::index::write_queue::WriteQueueHandle;
use crate::types::{
    ApplyOutcome, ContentCategory, EmbeddedRecord, IndexHealth, Scope, ScoredRecord,
};

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub k: usize,
    pub tenant_id: Option<String>,
    pub category: Option<ContentCategory>,
    pub score_threshold: Option<f32>,
}

pub struct IndexStore {
    index_root: PathBuf,
    dimensions: usize,
    auto_save: bool,
    embedder: Arc<Embedder>,
    global: Mutex<Option<CachedIndex>>,
    tenants: Mutex<TenantCache>,
    write_queue: OnceCell<WriteQueueHandle>,
}

impl IndexStore {
    pub fn new(config: &VectorStoreConfig, embedder: Arc<Embedder>) -> Arc<Self> {
        Arc::new(IndexStore {
            index_root: config.index_root.clone(),
            dimensions: config.embedding_dimensions,
            auto_save: config.auto_save,
            embedder,
            global: Mutex::new(None),
            tenants: Mutex::new(TenantCache::new(
                config.max_cached_tenant_indices,
                Duration::from_secs(config.tenant_cache_ttl_secs),
            )),
            write_queue: OnceCell::new(),
        })
    }

    /// Wire in the write queue after construction (the queue's apply callback
    /// needs this store, so the two can't be built in one step).
    pub fn attach_write_queue(&self, handle: WriteQueueHandle) {
        if self.write_queue.set(handle).is_err() {
            tracing::warn!("[IDX] write queue attached twice, keeping the first");
        }
    }

    pub fn write_queue(&self) -> Result<&WriteQueueHandle> {
        self.write_queue
            .get()
            .ok_or_else(|| MagpieError::Config("write queue not attached".into()))
    }

    // ── index handles ───────────────────────────────────────────────────

    /// Load or create an index for `scope`. A refused load (missing files,
    /// checksum mismatch) falls back to a fresh empty index — corruption is
    /// repaired by rebuild, never fatal here.
    fn load_or_create(&self, scope: &Scope) -> Result<CachedIndex> {
        let dir = scope.dir(&self.index_root);
        let index = match persistence::load_verified(&dir, &scope.key()) {
            Ok(Some(idx)) => {
                if idx.dimensions() != self.dimensions {
                    tracing::warn!(
                        "[IDX {}] stored dimensions {} != configured {}, starting fresh",
                        scope,
                        idx.dimensions(),
                        self.dimensions
                    );
                    AnnIndex::new(self.dimensions)?
                } else {
                    idx
                }
            }
            Ok(None) => AnnIndex::new(self.dimensions)?,
            Err(e) => {
                tracing::warn!("[IDX {}] load refused ({}), starting fresh", scope, e);
                AnnIndex::new(self.dimensions)?
            }
        };
        Ok(Arc::new(RwLock::new(index)))
    }

    pub fn global_index(&self) -> Result<CachedIndex> {
        let mut slot = self.global.lock().expect("global slot poisoned");
        if let Some(idx) = slot.as_ref() {
            return Ok(Arc::clone(idx));
        }
        let idx = self.load_or_create(&Scope::Global)?;
        *slot = Some(Arc::clone(&idx));
        Ok(idx)
    }

    pub fn tenant_index(&self, tenant_id: &str) -> Result<CachedIndex> {
        let mut expired;
        {
            let mut cache = self.tenants.lock().expect("tenant cache poisoned");
            expired = cache.sweep_expired();
            if let Some(idx) = cache.get(tenant_id) {
                drop(cache);
                self.flush_evicted(&expired);
                return Ok(idx);
            }
        }
        // Load outside the cache lock; re-check in case another caller won.
        let loaded = self.load_or_create(&Scope::Tenant(tenant_id.to_string()))?;
        let handle = {
            let mut cache = self.tenants.lock().expect("tenant cache poisoned");
            if let Some(existing) = cache.get(tenant_id) {
                existing
            } else {
                let evicted = cache.insert(tenant_id.to_string(), Arc::clone(&loaded));
                expired.extend(evicted);
                loaded
            }
        };
        self.flush_evicted(&expired);
        Ok(handle)
    }

    fn scoped_index(&self, scope: &Scope) -> Result<CachedIndex> {
        match scope {
            Scope::Global => self.global_index(),
            Scope::Tenant(id) => self.tenant_index(id),
        }
    }

    /// Flush-then-drop for evicted entries: no write is lost to cache
    /// pressure. Flush failures are logged, not propagated — the documents
    /// remain recoverable from the source of truth.
    fn flush_evicted(&self, evicted: &[(String, CachedIndex)]) {
        for (tenant_id, handle) in evicted {
            let scope = Scope::Tenant(tenant_id.clone());
            if let Err(e) = self.persist_handle(&scope, handle) {
                tracing::error!("[IDX {}] eviction flush failed: {}", scope, e);
            } else {
                tracing::debug!("[IDX {}] evicted from cache after flush", scope);
            }
        }
    }

    /// Force-persist one scope's index (rebuild finalization).
    pub fn persist_scope(&self, scope: &Scope) -> Result<()> {
        let handle = self.scoped_index(scope)?;
        self.persist_handle(scope, &handle)
    }

    fn persist_handle(&self, scope: &Scope, handle: &CachedIndex) -> Result<()> {
        let guard = handle
            .read()
            .map_err(|_| MagpieError::Io(format!("index lock poisoned for {scope}")))?;
        persistence::save_atomic(&guard, &scope.dir(&self.index_root))
    }

    // ── writes ──────────────────────────────────────────────────────────

    /// Queue records for indexing. Fire-and-forget past scope validation.
    pub fn add_documents(
        &self,
        records: Vec<EmbeddedRecord>,
        category: ContentCategory,
        tenant_id: Option<&str>,
    ) -> Result<Scope> {
        self.write_queue()?.enqueue(records, category, tenant_id)
    }

    /// The write queue's apply step: embed records still missing vectors,
    /// add everything to the scope's index, persist when auto-save is on.
    pub async fn apply_batch(
        &self,
        scope: &Scope,
        mut records: Vec<EmbeddedRecord>,
    ) -> Result<ApplyOutcome> {
        let missing: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            let texts: Vec<&str> = missing.iter().map(|&i| records[i].text.as_str()).collect();
            let vectors = self
                .embedder
                .embed_documents(&texts)
                .await
                .map_err(|e| MagpieError::WriteApply {
                    scope: scope.key(),
                    reason: format!("embedding failed: {e}"),
                })?;
            for (&i, vector) in missing.iter().zip(vectors) {
                records[i].embedding = Some(vector);
            }
        }

        let handle = self.scoped_index(scope)?;
        let mut applied = 0usize;
        let mut failed = 0usize;
        {
            let mut idx = handle.write().map_err(|_| MagpieError::WriteApply {
                scope: scope.key(),
                reason: "index lock poisoned".into(),
            })?;
            for rec in &records {
                let Some(vector) = rec.embedding.as_deref() else {
                    failed += 1;
                    continue;
                };
                match idx.add(&rec.id, rec.category, vector) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        tracing::warn!("[IDX {}] add failed for {}: {}", scope, rec.id, e);
                        failed += 1;
                    }
                }
            }
        }

        if self.auto_save && applied > 0 {
            self.persist_handle(scope, &handle)
                .map_err(|e| MagpieError::WriteApply {
                    scope: scope.key(),
                    reason: format!("persist failed: {e}"),
                })?;
        }

        if failed == 0 {
            Ok(ApplyOutcome::Applied(applied))
        } else {
            Ok(ApplyOutcome::Partial { applied, failed })
        }
    }

    // ── reads ───────────────────────────────────────────────────────────

    /// Embed the query and run a similarity search against the selected
    /// index (global when no tenant id is given).
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<ScoredRecord>> {
        let query_vec = self
            .embedder
            .embed_query(query)
            .await
            .map_err(|e| MagpieError::Search(e.to_string()))?;
        let scope = match &opts.tenant_id {
            Some(id) => Scope::Tenant(id.clone()),
            None => Scope::Global,
        };
        let handle = self.scoped_index(&scope)?;
        let idx = handle
            .read()
            .map_err(|_| MagpieError::Search(format!("index lock poisoned for {scope}")))?;
        let mut results = idx.search(&query_vec, opts.k, opts.category)?;
        if let Some(threshold) = opts.score_threshold {
            results.retain(|r| r.score >= threshold);
        }
        Ok(results)
    }

    pub fn document_count(&self, scope: &Scope) -> Result<usize> {
        let handle = self.scoped_index(scope)?;
        let idx = handle
            .read()
            .map_err(|_| MagpieError::Io(format!("index lock poisoned for {scope}")))?;
        Ok(idx.len())
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Remove a tenant's cache entry and on-disk directories.
    pub fn delete_tenant_index(&self, tenant_id: &str) -> Result<()> {
        {
            let mut cache = self.tenants.lock().expect("tenant cache poisoned");
            cache.remove(tenant_id);
        }
        let scope = Scope::Tenant(tenant_id.to_string());
        let dir = scope.dir(&self.index_root);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        let backup = dir.with_file_name(format!("{tenant_id}_backup"));
        if backup.exists() {
            std::fs::remove_dir_all(&backup)?;
        }
        tracing::info!("[IDX {}] deleted", scope);
        Ok(())
    }

    /// Reset a scope to a fresh empty index, in memory and on disk.
    /// Rebuilds start here so they never append to stale state.
    pub fn reset_scope(&self, scope: &Scope) -> Result<()> {
        let fresh = Arc::new(RwLock::new(AnnIndex::new(self.dimensions)?));
        match scope {
            Scope::Global => {
                *self.global.lock().expect("global slot poisoned") = Some(Arc::clone(&fresh));
            }
            Scope::Tenant(id) => {
                let mut cache = self.tenants.lock().expect("tenant cache poisoned");
                cache.remove(id);
                cache.insert(id.clone(), Arc::clone(&fresh));
            }
        }
        let dir = scope.dir(&self.index_root);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Operator-only destructive action: empty the global index and wipe
    /// every tenant directory.
    pub fn clear_all(&self) -> Result<()> {
        tracing::warn!("[IDX] clear_all: wiping global and all tenant indices");
        self.reset_scope(&Scope::Global)?;
        self.persist_handle(&Scope::Global, &self.global_index()?)?;
        {
            let mut cache = self.tenants.lock().expect("tenant cache poisoned");
            cache.drain_all();
        }
        let users_dir = self.index_root.join("users");
        if users_dir.exists() {
            std::fs::remove_dir_all(&users_dir)?;
        }
        Ok(())
    }

    /// Persist the global index and every cached tenant index. Used at
    /// shutdown; entries stay cached.
    pub fn persist_all(&self) -> Result<()> {
        let mut first_err = None;
        if let Some(global) = self.global.lock().expect("global slot poisoned").as_ref() {
            if let Err(e) = self.persist_handle(&Scope::Global, &Arc::clone(global)) {
                tracing::error!("[IDX global] persist failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        let entries = {
            let cache = self.tenants.lock().expect("tenant cache poisoned");
            cache.entries()
        };
        for (tenant_id, handle) in entries {
            let scope = Scope::Tenant(tenant_id);
            if let Err(e) = self.persist_handle(&scope, &handle) {
                tracing::error!("[IDX {}] persist failed: {}", scope, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ── health ──────────────────────────────────────────────────────────

    /// Point-in-time health of one index, computed from disk state plus any
    /// loaded handle. Never loads the HNSW structure itself.
    pub fn index_health(&self, scope: &Scope) -> IndexHealth {
        let dir = scope.dir(&self.index_root);
        let exists = dir.exists();
        let (checksum_valid, error) = if exists {
            match persistence::verify_checksum(&dir) {
                Ok(ok) => (ok, None),
                Err(e) => (false, Some(e.to_string())),
            }
        } else {
            (false, None)
        };
        let document_count = self
            .loaded_count(scope)
            .or_else(|| persistence::stored_document_count(&dir))
            .unwrap_or(0);
        IndexHealth {
            scope: scope.clone(),
            path: dir.clone(),
            exists,
            checksum_valid,
            document_count,
            size_bytes: persistence::dir_size_bytes(&dir),
            last_modified: persistence::last_modified(&dir),
            needs_rebuild: exists && !checksum_valid,
            error,
        }
    }

    fn loaded_count(&self, scope: &Scope) -> Option<usize> {
        let handle = match scope {
            Scope::Global => self
                .global
                .lock()
                .expect("global slot poisoned")
                .as_ref()
                .map(Arc::clone)?,
            Scope::Tenant(id) => {
                let cache = self.tenants.lock().expect("tenant cache poisoned");
                cache.peek(id)?
            }
        };
        let guard = handle.read().ok()?;
        Some(guard.len())
    }

    /// Tenant ids of cached indices, most recently used first.
    pub fn recently_accessed_tenants(&self, n: usize) -> Vec<String> {
        let cache = self.tenants.lock().expect("tenant cache poisoned");
        cache.recently_accessed(n)
    }

    pub fn cached_tenant_count(&self) -> usize {
        let cache = self.tenants.lock().expect("tenant cache poisoned");
        cache.len()
    }

    pub fn index_root(&self) -> &std::path::Path {
        &self.index_root
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;

    const DIMS: usize = 32;

    fn test_config(root: &std::path::Path) -> VectorStoreConfig {
        VectorStoreConfig {
            index_root: root.to_path_buf(),
            embedding_dimensions: DIMS,
            ..Default::default()
        }
    }

    fn test_store(root: &std::path::Path) -> Arc<IndexStore> {
        IndexStore::new(
            &test_config(root),
            Arc::new(Embedder::deterministic(DIMS)),
        )
    }

    fn record(id: &str, category: ContentCategory, text: &str) -> EmbeddedRecord {
        EmbeddedRecord {
            id: id.into(),
            category,
            text: text.into(),
            embedding: None,
            provenance: Provenance {
                source_doc_id: id.into(),
                chunk_index: 0,
                content_hash: format!("h-{id}"),
            },
        }
    }

    // ── apply + search ──────────────────────────────────────────────────

    #[tokio::test]
    async fn apply_batch_embeds_missing_vectors_and_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());

        let outcome = store
            .apply_batch(
                &Scope::Tenant("t1".into()),
                vec![
                    record("a", ContentCategory::Prompts, "monthly token spend"),
                    record("b", ContentCategory::Prompts, "weekly usage report"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(2));

        // auto_save is on by default: files are on disk.
        let dir = tmp.path().join("users").join("t1");
        assert!(dir.join("checksum.txt").exists());

        let results = store
            .search(
                "monthly token spend",
                &SearchOptions {
                    k: 2,
                    tenant_id: Some("t1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results[0].doc_id, "a");
    }

    #[tokio::test]
    async fn search_scope_isolation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());

        store
            .apply_batch(
                &Scope::Tenant("a".into()),
                vec![record("doc-a", ContentCategory::Prompts, "secret plans")],
            )
            .await
            .unwrap();
        store
            .apply_batch(
                &Scope::Tenant("b".into()),
                vec![record("doc-b", ContentCategory::Prompts, "other things")],
            )
            .await
            .unwrap();

        let hits_b = store
            .search(
                "secret plans",
                &SearchOptions {
                    k: 10,
                    tenant_id: Some("b".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(hits_b.iter().all(|r| r.doc_id != "doc-a"));
    }

    #[tokio::test]
    async fn search_score_threshold_filters() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());

        store
            .apply_batch(
                &Scope::Global,
                vec![
                    record("near", ContentCategory::Guides, "billing dashboard setup"),
                    record("far", ContentCategory::Guides, "unrelated appendix content"),
                ],
            )
            .await
            .unwrap();

        let all = store
            .search(
                "billing dashboard setup",
                &SearchOptions {
                    k: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let strict = store
            .search(
                "billing dashboard setup",
                &SearchOptions {
                    k: 10,
                    score_threshold: Some(0.9),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].doc_id, "near");
    }

    // ── persistence lifecycle ───────────────────────────────────────────

    #[tokio::test]
    async fn documents_survive_store_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let store = test_store(tmp.path());
            store
                .apply_batch(
                    &Scope::Global,
                    vec![record("g1", ContentCategory::Guides, "persisted guide")],
                )
                .await
                .unwrap();
        }
        let reopened = test_store(tmp.path());
        assert_eq!(reopened.document_count(&Scope::Global).unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupted_index_falls_back_to_fresh() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let store = test_store(tmp.path());
            store
                .apply_batch(
                    &Scope::Global,
                    vec![record("g1", ContentCategory::Guides, "guide text")],
                )
                .await
                .unwrap();
        }
        std::fs::write(tmp.path().join("global").join("index.usearch"), b"junk").unwrap();

        let reopened = test_store(tmp.path());
        // Load is refused, caller gets a working empty index instead of a crash.
        assert_eq!(reopened.document_count(&Scope::Global).unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_checksum_reports_needs_rebuild() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());
        store
            .apply_batch(
                &Scope::Global,
                vec![record("g1", ContentCategory::Guides, "guide text")],
            )
            .await
            .unwrap();

        std::fs::write(tmp.path().join("global").join("index.usearch"), b"mutated").unwrap();

        let health = store.index_health(&Scope::Global);
        assert!(health.exists);
        assert!(!health.checksum_valid);
        assert!(health.needs_rebuild);
    }

    #[tokio::test]
    async fn health_of_absent_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let health = store.index_health(&Scope::Tenant("ghost".into()));
        assert!(!health.exists);
        assert!(!health.needs_rebuild);
        assert_eq!(health.document_count, 0);
    }

    // ── cache eviction flush ────────────────────────────────────────────

    #[tokio::test]
    async fn eviction_persists_before_dropping() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = VectorStoreConfig {
            index_root: tmp.path().to_path_buf(),
            embedding_dimensions: DIMS,
            max_cached_tenant_indices: 1,
            auto_save: false,
            ..Default::default()
        };
        let store = IndexStore::new(&config, Arc::new(Embedder::deterministic(DIMS)));

        store
            .apply_batch(
                &Scope::Tenant("first".into()),
                vec![record("d1", ContentCategory::Prompts, "kept through eviction")],
            )
            .await
            .unwrap();
        // auto_save off: nothing on disk yet.
        assert!(!tmp.path().join("users").join("first").exists());

        // Loading a second tenant evicts "first", which must flush first.
        store.tenant_index("second").unwrap();
        assert!(tmp.path().join("users").join("first").join("checksum.txt").exists());

        // Reload finds the evicted tenant's document.
        assert_eq!(
            store.document_count(&Scope::Tenant("first".into())).unwrap(),
            1
        );
    }

    // ── destructive operations ──────────────────────────────────────────

    #[tokio::test]
    async fn delete_tenant_removes_disk_and_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());
        store
            .apply_batch(
                &Scope::Tenant("gone".into()),
                vec![record("d1", ContentCategory::Prompts, "to be deleted")],
            )
            .await
            .unwrap();
        assert!(tmp.path().join("users").join("gone").exists());

        store.delete_tenant_index("gone").unwrap();
        assert!(!tmp.path().join("users").join("gone").exists());
        assert_eq!(
            store.document_count(&Scope::Tenant("gone".into())).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn clear_all_resets_global_and_wipes_tenants() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());
        store
            .apply_batch(
                &Scope::Global,
                vec![record("g", ContentCategory::Guides, "global doc")],
            )
            .await
            .unwrap();
        store
            .apply_batch(
                &Scope::Tenant("t".into()),
                vec![record("t", ContentCategory::Prompts, "tenant doc")],
            )
            .await
            .unwrap();

        store.clear_all().unwrap();
        assert_eq!(store.document_count(&Scope::Global).unwrap(), 0);
        assert!(!tmp.path().join("users").exists());
        assert_eq!(store.cached_tenant_count(), 0);
    }

    // ── write queue wiring ──────────────────────────────────────────────

    #[tokio::test]
    async fn add_documents_without_queue_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let err = store
            .add_documents(
                vec![record("x", ContentCategory::Prompts, "text")],
                ContentCategory::Prompts,
                Some("t1"),
            )
            .unwrap_err();
        assert!(matches!(err, MagpieError::Config(_)));
    }
}
