//! Rebuild and validation machinery.
//!
//! The ANN index is a derived cache: any corrupted, missing, or divergent
//! index is reconstructed wholesale from the source-of-truth store. Rebuilds
//! are best-effort — a failed batch is counted and skipped, never fatal —
//! and always start from a cleared index.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::VectorStoreConfig;
use crate::error::{MagpieError, Result};
use crate::index::store::IndexStore;
use crate::store::DocumentStore;
use crate::types::{IndexHealth, RecoveryProgress, RecoveryStatus, Scope, SourceDocument};

/// Relative document-count discrepancy between an index and its source, as a
/// percentage of the source count.
pub(crate) fn discrepancy_pct(index_count: usize, source_count: u64) -> f64 {
    if source_count == 0 {
        return if index_count == 0 { 0.0 } else { 100.0 };
    }
    let diff = (index_count as f64 - source_count as f64).abs();
    diff / source_count as f64 * 100.0
}

/// Full validation pass across the global index and every tenant with
/// eligible documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub global: IndexHealth,
    pub tenants: Vec<IndexHealth>,
    pub healthy_count: usize,
    pub corrupted_count: usize,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn scopes_needing_rebuild(&self) -> Vec<Scope> {
        std::iter::once(&self.global)
            .chain(self.tenants.iter())
            .filter(|h| h.needs_rebuild)
            .map(|h| h.scope.clone())
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.corrupted_count == 0
    }
}

pub struct RecoveryEngine {
    index_store: Arc<IndexStore>,
    store: Arc<dyn DocumentStore>,
    progress: DashMap<String, RecoveryProgress>,
    batch_size: u64,
    docs_per_sec: f64,
    max_concurrent: usize,
    hard_pct: f64,
}

impl RecoveryEngine {
    pub fn new(
        config: &VectorStoreConfig,
        store: Arc<dyn DocumentStore>,
        index_store: Arc<IndexStore>,
    ) -> Arc<Self> {
        Arc::new(RecoveryEngine {
            index_store,
            store,
            progress: DashMap::new(),
            batch_size: config.rebuild_batch_size.max(1) as u64,
            docs_per_sec: config.rebuild_docs_per_sec,
            max_concurrent: config.max_concurrent_rebuilds.max(1),
            hard_pct: config.discrepancy_hard_pct,
        })
    }

    /// Live progress for an in-flight rebuild, if one is running.
    pub fn progress(&self, scope: &Scope) -> Option<RecoveryProgress> {
        self.progress.get(&scope.key()).map(|p| p.clone())
    }

    pub async fn rebuild_global(&self) -> Result<RecoveryProgress> {
        self.rebuild(&Scope::Global).await
    }

    pub async fn rebuild_tenant(&self, tenant_id: &str) -> Result<RecoveryProgress> {
        self.rebuild(&Scope::Tenant(tenant_id.to_string())).await
    }

    /// Rebuild one scope's index from the source of truth. Guarded against
    /// concurrent re-entry per scope.
    pub async fn rebuild(&self, scope: &Scope) -> Result<RecoveryProgress> {
        use dashmap::mapref::entry::Entry;
        match self.progress.entry(scope.key()) {
            Entry::Occupied(_) => {
                return Err(MagpieError::RebuildInProgress(scope.key()));
            }
            Entry::Vacant(slot) => {
                slot.insert(RecoveryProgress {
                    scope: scope.clone(),
                    total_documents: 0,
                    processed_documents: 0,
                    failed_documents: 0,
                    status: RecoveryStatus::Pending,
                    started_at: Utc::now(),
                    finished_at: None,
                });
            }
        }

        let result = self.run_rebuild(scope).await;
        // The progress record lives only while the rebuild is in flight.
        let final_progress = self
            .progress
            .remove(&scope.key())
            .map(|(_, p)| p);

        match result {
            Ok(()) => {
                let mut progress = final_progress.ok_or_else(|| MagpieError::Rebuild {
                    scope: scope.key(),
                    reason: "progress record lost".into(),
                })?;
                progress.status = RecoveryStatus::Completed;
                progress.finished_at = Some(Utc::now());
                tracing::info!(
                    "[RECOVERY {}] rebuild complete: {} processed, {} failed",
                    scope,
                    progress.processed_documents,
                    progress.failed_documents
                );
                Ok(progress)
            }
            Err(e) => {
                tracing::error!("[RECOVERY {}] rebuild failed: {}", scope, e);
                Err(e)
            }
        }
    }

    async fn run_rebuild(&self, scope: &Scope) -> Result<()> {
        tracing::info!("[RECOVERY {}] starting rebuild", scope);
        // Always start from a cleared index — never append to stale state.
        self.index_store.reset_scope(scope)?;

        let total = self
            .store
            .count(scope)
            .await
            .map_err(|e| MagpieError::Rebuild {
                scope: scope.key(),
                reason: format!("source count failed: {e}"),
            })?;
        self.update_progress(scope, |p| {
            p.total_documents = total;
            p.status = RecoveryStatus::InProgress;
        });

        let mut skip = 0u64;
        loop {
            let batch = self
                .store
                .fetch_batch(scope, skip, self.batch_size)
                .await
                .map_err(|e| MagpieError::Rebuild {
                    scope: scope.key(),
                    reason: format!("source read failed at offset {skip}: {e}"),
                })?;
            if batch.is_empty() {
                break;
            }
            skip += batch.len() as u64;

            let records = batch.iter().map(SourceDocument::to_embedded).collect();
            let (applied, failed) = match self.index_store.apply_batch(scope, records).await {
                Ok(outcome) => (outcome.applied() as u64, outcome.failed() as u64),
                Err(e) => {
                    tracing::warn!(
                        "[RECOVERY {}] batch of {} failed, continuing: {}",
                        scope,
                        batch.len(),
                        e
                    );
                    (0, batch.len() as u64)
                }
            };
            self.update_progress(scope, |p| {
                p.processed_documents += applied;
                p.failed_documents += failed;
            });
            if let Some(p) = self.progress(scope) {
                tracing::debug!(
                    "[RECOVERY {}] {:.1}% ({}/{})",
                    scope,
                    p.percent_complete(),
                    p.processed_documents,
                    p.total_documents
                );
            }
        }

        self.index_store
            .persist_scope(scope)
            .map_err(|e| MagpieError::Rebuild {
                scope: scope.key(),
                reason: format!("final persist failed: {e}"),
            })
    }

    fn update_progress(&self, scope: &Scope, f: impl FnOnce(&mut RecoveryProgress)) {
        if let Some(mut entry) = self.progress.get_mut(&scope.key()) {
            f(entry.value_mut());
        }
    }

    // ── validation ──────────────────────────────────────────────────────

    /// Health of every index, with document counts cross-checked against the
    /// source of truth. Mismatches past the hard threshold flag a rebuild.
    pub async fn validate_all_indices(&self) -> Result<ValidationReport> {
        let mut recommendations = Vec::new();
        let global = self.checked_health(&Scope::Global, &mut recommendations).await?;

        let mut tenants = Vec::new();
        for tenant_id in self.store.tenant_ids().await? {
            let scope = Scope::Tenant(tenant_id);
            if self.store.count(&scope).await? == 0 {
                continue;
            }
            tenants.push(self.checked_health(&scope, &mut recommendations).await?);
        }

        let corrupted_count = std::iter::once(&global)
            .chain(tenants.iter())
            .filter(|h| h.needs_rebuild)
            .count();
        let healthy_count = 1 + tenants.len() - corrupted_count;

        Ok(ValidationReport {
            global,
            tenants,
            healthy_count,
            corrupted_count,
            recommendations,
            generated_at: Utc::now(),
        })
    }

    async fn checked_health(
        &self,
        scope: &Scope,
        recommendations: &mut Vec<String>,
    ) -> Result<IndexHealth> {
        let mut health = self.index_store.index_health(scope);
        let source_count = self.store.count(scope).await?;

        if health.exists && !health.checksum_valid {
            recommendations.push(format!("{scope}: checksum invalid, rebuild required"));
        } else if !health.exists && source_count > 0 {
            health.needs_rebuild = true;
            recommendations.push(format!(
                "{scope}: index missing for {source_count} source documents, rebuild required"
            ));
        } else {
            let pct = discrepancy_pct(health.document_count, source_count);
            if pct > self.hard_pct {
                health.needs_rebuild = true;
                recommendations.push(format!(
                    "{scope}: document count {} diverges {:.1}% from source count {}, rebuild recommended",
                    health.document_count, pct, source_count
                ));
            }
        }
        Ok(health)
    }

    // ── background recovery ─────────────────────────────────────────────

    /// Validate, then rebuild every flagged scope, at most
    /// `max_concurrent_rebuilds` at a time.
    pub async fn rebuild_in_background(
        self: &Arc<Self>,
    ) -> Result<Vec<(Scope, Result<RecoveryProgress>)>> {
        let report = self.validate_all_indices().await?;
        let scopes = report.scopes_needing_rebuild();
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(
            "[RECOVERY] background rebuild of {} indices (max {} concurrent)",
            scopes.len(),
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("rebuild semaphore closed");
                let result = engine.rebuild(&scope).await;
                (scope, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|e| MagpieError::Rebuild {
                scope: "background".into(),
                reason: format!("rebuild task panicked: {e}"),
            })?);
        }
        Ok(results)
    }

    /// Rough operator-facing estimate: source count over an assumed fixed
    /// throughput (embedding cost included). Not a guarantee.
    pub async fn estimate_rebuild_time(&self, scope: &Scope) -> Result<Duration> {
        let count = self.store.count(scope).await?;
        if self.docs_per_sec <= 0.0 {
            return Err(MagpieError::Config("rebuild_docs_per_sec must be positive".into()));
        }
        Ok(Duration::from_secs_f64(count as f64 / self.docs_per_sec))
    }
}
