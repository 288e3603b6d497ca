//! Derived vector index store.
//!
//! A durable document store is the source of truth; the ANN indices magpie
//! maintains (one global, one per tenant) are rebuildable caches over it.
//! Writes are serialized through a batching queue, persistence is atomic and
//! checksummed, a strategy router phases traffic between the store-backed
//! and ANN-backed search paths, and recovery/health machinery detects and
//! repairs divergence.
//!
//! Construct one [`VectorSearchService`] per process and share it by handle:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use magpie::{
//!     ContentCategory, Embedder, MemoryDocumentStore, VectorSearchService, VectorStoreConfig,
//! };
//!
//! # async fn run() -> magpie::Result<()> {
//! let config = VectorStoreConfig::from_env();
//! let store = Arc::new(MemoryDocumentStore::new());
//! let embedder = Embedder::rest("https://embeddings.internal/v1/embed", "small-384", 384);
//! let service = VectorSearchService::new(config, store, embedder);
//! service.start();
//!
//! let hits = service
//!     .search("prompt caching discount", 10, Some("tenant-42"), None)
//!     .await?;
//! # let _ = hits;
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedder;
pub mod error;
pub mod health;
pub mod index;
pub mod recovery;
pub mod router;
pub mod store;
pub mod types;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

pub use config::{RoutingMode, VectorStoreConfig};
pub use embedder::Embedder;
pub use error::{MagpieError, Result};
pub use health::{HealthMetrics, HealthMonitor, StartupReport};
pub use index::{IndexStore, SearchOptions, WriteQueueHandle};
pub use recovery::{RecoveryEngine, ValidationReport};
pub use router::{DivergenceRecord, DivergenceStats, StrategyRouter};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use types::{
    ApplyOutcome, ContentCategory, EmbeddedRecord, IndexHealth, Provenance, RecoveryProgress,
    RecoveryStatus, Scope, ScoredRecord, SourceDocument, WriteQueueStatsSnapshot,
};

use crate::index::write_queue::{create_write_queue, BatchApplyFn, WriteQueueOptions};

/// Application context owning the whole subsystem: index store, write queue,
/// strategy router, recovery engine, and health monitor. One instance per
/// process, constructed at startup and passed by handle — no global state.
pub struct VectorSearchService {
    index_store: Arc<IndexStore>,
    router: Arc<StrategyRouter>,
    recovery: Arc<RecoveryEngine>,
    health: Arc<HealthMonitor>,
    write_queue: WriteQueueHandle,
    write_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl VectorSearchService {
    pub fn new(
        config: VectorStoreConfig,
        store: Arc<dyn DocumentStore>,
        embedder: Embedder,
    ) -> Arc<Self> {
        let index_store = IndexStore::new(&config, Arc::new(embedder));

        let apply_target = Arc::clone(&index_store);
        let apply: BatchApplyFn = Arc::new(move |scope, records| {
            let target = Arc::clone(&apply_target);
            Box::pin(async move { target.apply_batch(&scope, records).await })
        });
        let (write_queue, write_task) =
            create_write_queue(WriteQueueOptions::from_config(&config), apply);
        index_store.attach_write_queue(write_queue.clone());

        let router = StrategyRouter::new(&config, Arc::clone(&store), Arc::clone(&index_store));
        let recovery = RecoveryEngine::new(&config, Arc::clone(&store), Arc::clone(&index_store));
        let health = HealthMonitor::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&index_store),
            Arc::clone(&recovery),
        );

        Arc::new(VectorSearchService {
            index_store,
            router,
            recovery,
            health,
            write_queue,
            write_task: Mutex::new(Some(write_task)),
            health_task: Mutex::new(None),
        })
    }

    /// Run startup validation and start the periodic health loop. Returns
    /// the startup report; an unhealthy report never blocks startup.
    pub fn start(self: &Arc<Self>) -> StartupReport {
        let report = self.health.validate_startup();
        let handle = self.health.spawn_periodic();
        *self.health_task.lock().expect("health task slot poisoned") = Some(handle);
        report
    }

    // ── operational API ─────────────────────────────────────────────────

    /// Add documents under the current routing mode.
    pub async fn add(
        &self,
        docs: Vec<SourceDocument>,
        category: ContentCategory,
        tenant_id: Option<&str>,
    ) -> Result<Scope> {
        self.router.add(docs, category, tenant_id).await
    }

    /// Ranked similarity (or store-text, depending on phase) search.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        tenant_id: Option<&str>,
        category: Option<ContentCategory>,
    ) -> Result<Vec<ScoredRecord>> {
        self.router.search(query, k, tenant_id, category).await
    }

    pub fn index_health(&self, tenant_id: Option<&str>) -> IndexHealth {
        let scope = match tenant_id {
            Some(id) => Scope::Tenant(id.to_string()),
            None => Scope::Global,
        };
        self.index_store.index_health(&scope)
    }

    pub async fn rebuild_global(&self) -> Result<RecoveryProgress> {
        self.recovery.rebuild_global().await
    }

    pub async fn rebuild_tenant(&self, tenant_id: &str) -> Result<RecoveryProgress> {
        self.recovery.rebuild_tenant(tenant_id).await
    }

    pub fn rebuild_progress(&self, tenant_id: Option<&str>) -> Option<RecoveryProgress> {
        let scope = match tenant_id {
            Some(id) => Scope::Tenant(id.to_string()),
            None => Scope::Global,
        };
        self.recovery.progress(&scope)
    }

    pub async fn validate_all_indices(&self) -> Result<ValidationReport> {
        self.recovery.validate_all_indices().await
    }

    pub async fn trigger_validation(&self) -> Result<ValidationReport> {
        self.health.trigger_validation().await
    }

    pub fn write_queue_stats(&self) -> WriteQueueStatsSnapshot {
        self.write_queue.stats()
    }

    pub fn divergence_stats(&self) -> DivergenceStats {
        self.router.divergence_stats()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        self.health.health_metrics()
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.router.mode()
    }

    pub fn set_routing_mode(&self, mode: RoutingMode) {
        self.router.set_mode(mode);
    }

    pub fn delete_tenant_index(&self, tenant_id: &str) -> Result<()> {
        self.index_store.delete_tenant_index(tenant_id)
    }

    /// Operator-only: reset the global index and wipe all tenant indices.
    pub fn clear_all_indices(&self) -> Result<()> {
        self.index_store.clear_all()
    }

    /// Flush the write queue, stop the health loop, and persist every
    /// cached index.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("[SVC] shutting down: flushing write queue");
        self.write_queue.flush().await?;
        if let Some(handle) = self
            .health_task
            .lock()
            .expect("health task slot poisoned")
            .take()
        {
            handle.abort();
        }
        self.index_store.persist_all()?;
        tracing::info!("[SVC] shutdown complete");
        Ok(())
    }
}

impl Drop for VectorSearchService {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.write_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
