//! Startup and periodic assurance that the ANN layer has not silently
//! drifted from the source of truth.
//!
//! Corruption never blocks startup or crashes the monitor — it triggers a
//! background rebuild and shows up in metrics for operators.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::VectorStoreConfig;
use crate::error::{MagpieError, Result};
use crate::index::store::IndexStore;
use crate::recovery::{discrepancy_pct, RecoveryEngine, ValidationReport};
use crate::store::DocumentStore;
use crate::types::{IndexHealth, Scope};

/// How many recently used tenant indices the startup check samples.
const STARTUP_TENANT_SAMPLE: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupReport {
    pub healthy: bool,
    pub checked: Vec<IndexHealth>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub global: IndexHealth,
    pub cached_tenant_indices: usize,
    pub memory_used_pct: f64,
    pub last_validation_at: Option<DateTime<Utc>>,
}

pub struct HealthMonitor {
    index_store: Arc<IndexStore>,
    store: Arc<dyn DocumentStore>,
    recovery: Arc<RecoveryEngine>,
    interval: Duration,
    soft_pct: f64,
    hard_pct: f64,
    memory_threshold_pct: f64,
    auto_recovery: bool,
    last_validation: Mutex<Option<DateTime<Utc>>>,
}

/// Whole-system memory usage as a percentage.
pub fn memory_used_pct() -> f64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    sys.used_memory() as f64 / total as f64 * 100.0
}

impl HealthMonitor {
    pub fn new(
        config: &VectorStoreConfig,
        store: Arc<dyn DocumentStore>,
        index_store: Arc<IndexStore>,
        recovery: Arc<RecoveryEngine>,
    ) -> Arc<Self> {
        Arc::new(HealthMonitor {
            index_store,
            store,
            recovery,
            interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
            soft_pct: config.discrepancy_soft_pct,
            hard_pct: config.discrepancy_hard_pct,
            memory_threshold_pct: config.memory_threshold_pct,
            auto_recovery: config.auto_recovery,
            last_validation: Mutex::new(None),
        })
    }

    // ── startup ─────────────────────────────────────────────────────────

    /// Check the global index plus a bounded sample of recently used tenant
    /// indices. Corruption schedules a background rebuild; the process comes
    /// up either way.
    pub fn validate_startup(self: &Arc<Self>) -> StartupReport {
        let mut checked = vec![self.index_store.index_health(&Scope::Global)];
        for tenant_id in self.index_store.recently_accessed_tenants(STARTUP_TENANT_SAMPLE) {
            checked.push(self.index_store.index_health(&Scope::Tenant(tenant_id)));
        }

        let mut recommendations = Vec::new();
        for health in &checked {
            if health.needs_rebuild {
                recommendations.push(format!(
                    "{}: corrupt index detected at startup, rebuild scheduled",
                    health.scope
                ));
                self.spawn_rebuild(health.scope.clone());
            }
        }

        let healthy = recommendations.is_empty();
        if healthy {
            tracing::info!("[HEALTH] startup validation passed ({} indices)", checked.len());
        } else {
            tracing::warn!(
                "[HEALTH] startup validation found {} unhealthy indices",
                recommendations.len()
            );
        }
        StartupReport {
            healthy,
            checked,
            recommendations,
        }
    }

    // ── periodic ────────────────────────────────────────────────────────

    /// Start the periodic validation loop. The first cycle runs one full
    /// interval after startup.
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.run_validation_cycle().await {
                    tracing::warn!("[HEALTH] validation cycle failed: {}", e);
                }
                monitor.check_memory();
            }
        })
    }

    /// One full validation pass: every index's health, document counts
    /// cross-checked against the source of truth. Hard-threshold
    /// discrepancies schedule rebuilds without blocking the cycle.
    pub async fn run_validation_cycle(self: &Arc<Self>) -> Result<ValidationReport> {
        let report = self.recovery.validate_all_indices().await?;
        *self
            .last_validation
            .lock()
            .expect("last_validation poisoned") = Some(Utc::now());

        for health in std::iter::once(&report.global).chain(report.tenants.iter()) {
            let source_count = match self.store.count(&health.scope).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("[HEALTH {}] source count failed: {}", health.scope, e);
                    continue;
                }
            };
            let pct = discrepancy_pct(health.document_count, source_count);
            if pct > self.hard_pct {
                tracing::warn!(
                    "[HEALTH {}] document count {} vs source {} ({:.1}% off), scheduling rebuild",
                    health.scope,
                    health.document_count,
                    source_count,
                    pct
                );
                self.spawn_rebuild(health.scope.clone());
            } else if pct > self.soft_pct {
                tracing::warn!(
                    "[HEALTH {}] document count {} vs source {} ({:.1}% off)",
                    health.scope,
                    health.document_count,
                    source_count,
                    pct
                );
            }
        }
        Ok(report)
    }

    fn spawn_rebuild(&self, scope: Scope) {
        let recovery = Arc::clone(&self.recovery);
        tokio::spawn(async move {
            match recovery.rebuild(&scope).await {
                Ok(progress) => tracing::info!(
                    "[HEALTH {}] background rebuild done: {} processed, {} failed",
                    scope,
                    progress.processed_documents,
                    progress.failed_documents
                ),
                Err(MagpieError::RebuildInProgress(_)) => {
                    tracing::debug!("[HEALTH {}] rebuild already running", scope);
                }
                Err(e) => tracing::warn!("[HEALTH {}] background rebuild failed: {}", scope, e),
            }
        });
    }

    /// Advisory only: warn when process-wide memory crosses the threshold.
    pub fn check_memory(&self) -> f64 {
        let pct = memory_used_pct();
        if pct > self.memory_threshold_pct {
            tracing::warn!(
                "[HEALTH] memory usage {:.1}% above threshold {:.1}%",
                pct,
                self.memory_threshold_pct
            );
        }
        pct
    }

    // ── operator surface ────────────────────────────────────────────────

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMetrics {
            global: self.index_store.index_health(&Scope::Global),
            cached_tenant_indices: self.index_store.cached_tenant_count(),
            memory_used_pct: memory_used_pct(),
            last_validation_at: *self
                .last_validation
                .lock()
                .expect("last_validation poisoned"),
        }
    }

    /// Operator-invoked validation. With auto-recovery enabled, unhealthy
    /// indices kick off a background rebuild sweep.
    pub async fn trigger_validation(self: &Arc<Self>) -> Result<ValidationReport> {
        let report = self.run_validation_cycle().await?;
        if self.auto_recovery && !report.is_healthy() {
            let recovery = Arc::clone(&self.recovery);
            tokio::spawn(async move {
                match recovery.rebuild_in_background().await {
                    Ok(results) => tracing::info!(
                        "[HEALTH] auto-recovery rebuilt {} indices",
                        results.len()
                    ),
                    Err(e) => tracing::warn!("[HEALTH] auto-recovery failed: {}", e),
                }
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use crate::store::{DocumentStore, MemoryDocumentStore};
    use crate::types::{ContentCategory, SourceDocument};

    const DIMS: usize = 32;

    struct Rig {
        monitor: Arc<HealthMonitor>,
        store: Arc<MemoryDocumentStore>,
        index_store: Arc<IndexStore>,
        _tmp: tempfile::TempDir,
    }

    fn rig(auto_recovery: bool) -> Rig {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = VectorStoreConfig {
            index_root: tmp.path().to_path_buf(),
            embedding_dimensions: DIMS,
            auto_recovery,
            ..Default::default()
        };
        let store = Arc::new(MemoryDocumentStore::new());
        let index_store = IndexStore::new(&config, Arc::new(Embedder::deterministic(DIMS)));
        let recovery = RecoveryEngine::new(
            &config,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&index_store),
        );
        let monitor = HealthMonitor::new(
            &config,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&index_store),
            recovery,
        );
        Rig {
            monitor,
            store,
            index_store,
            _tmp: tmp,
        }
    }

    fn doc(id: &str, tenant: &str, text: &str) -> SourceDocument {
        SourceDocument {
            id: id.into(),
            category: ContentCategory::Prompts,
            tenant_id: Some(tenant.into()),
            text: text.into(),
            chunk_index: 0,
            content_hash: format!("h-{id}"),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ── startup ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn startup_on_empty_system_is_healthy() {
        let r = rig(false);
        let report = r.monitor.validate_startup();
        assert!(report.healthy);
        assert_eq!(report.checked.len(), 1);
        assert!(report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn startup_detects_corruption_and_schedules_rebuild() {
        let r = rig(false);
        r.store
            .insert(&[doc("d1", "acme", "tenant prompt")])
            .await
            .unwrap();
        r.index_store
            .apply_batch(
                &Scope::Tenant("acme".into()),
                vec![doc("d1", "acme", "tenant prompt").to_embedded()],
            )
            .await
            .unwrap();

        let dir = r.index_store.index_root().join("users").join("acme");
        std::fs::write(dir.join("index.usearch"), b"flipped bits").unwrap();

        let report = r.monitor.validate_startup();
        assert!(!report.healthy);
        assert!(report.recommendations[0].contains("users/acme"));

        // Startup is not blocked; the rebuild repairs in the background.
        wait_until(|| {
            r.index_store
                .index_health(&Scope::Tenant("acme".into()))
                .checksum_valid
        })
        .await;
        assert_eq!(
            r.index_store
                .document_count(&Scope::Tenant("acme".into()))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn startup_samples_bounded_number_of_tenants() {
        let r = rig(false);
        for i in 0..8 {
            r.index_store.tenant_index(&format!("t{i}")).unwrap();
        }
        let report = r.monitor.validate_startup();
        // Global plus at most five recently used tenants.
        assert!(report.checked.len() <= 1 + STARTUP_TENANT_SAMPLE);
    }

    // ── periodic cycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn cycle_schedules_rebuild_past_hard_discrepancy() {
        let r = rig(false);
        let docs: Vec<SourceDocument> = (0..10)
            .map(|i| doc(&format!("d{i}"), "acme", &format!("prompt {i}")))
            .collect();
        r.store.insert(&docs).await.unwrap();
        // Index holds 2 of 10 source documents: 80% off, past the 10% hard
        // threshold.
        r.index_store
            .apply_batch(
                &Scope::Tenant("acme".into()),
                docs[..2].iter().map(|d| d.to_embedded()).collect(),
            )
            .await
            .unwrap();

        let report = r.monitor.run_validation_cycle().await.unwrap();
        assert!(!report.is_healthy());

        wait_until(|| {
            r.index_store
                .document_count(&Scope::Tenant("acme".into()))
                .map(|n| n == 10)
                .unwrap_or(false)
        })
        .await;
        assert!(r.monitor.health_metrics().last_validation_at.is_some());
    }

    #[tokio::test]
    async fn spawn_periodic_runs_and_stops_on_abort() {
        let r = rig(false);
        let handle = r.monitor.spawn_periodic();
        assert!(!handle.is_finished());
        handle.abort();
    }

    // ── memory watchdog ─────────────────────────────────────────────────

    #[test]
    fn memory_pct_is_sane() {
        let pct = memory_used_pct();
        assert!((0.0..=100.0).contains(&pct), "pct out of range: {pct}");
    }

    #[tokio::test]
    async fn check_memory_is_advisory() {
        let r = rig(false);
        // No remediation, just a reading (warning is logged past threshold).
        let pct = r.monitor.check_memory();
        assert!((0.0..=100.0).contains(&pct));
    }

    // ── operator surface ────────────────────────────────────────────────

    #[tokio::test]
    async fn health_metrics_snapshot() {
        let r = rig(false);
        r.index_store.tenant_index("t1").unwrap();
        let metrics = r.monitor.health_metrics();
        assert_eq!(metrics.cached_tenant_indices, 1);
        assert!(metrics.last_validation_at.is_none());
        assert_eq!(metrics.global.scope, Scope::Global);
    }

    #[tokio::test]
    async fn trigger_validation_with_auto_recovery_repairs() {
        let r = rig(true);
        r.store
            .insert(&[doc("d1", "acme", "needs indexing")])
            .await
            .unwrap();

        // No index on disk yet: validation flags it, auto-recovery fixes it.
        let report = r.monitor.trigger_validation().await.unwrap();
        assert!(!report.is_healthy());

        wait_until(|| {
            r.index_store
                .document_count(&Scope::Tenant("acme".into()))
                .map(|n| n == 1)
                .unwrap_or(false)
        })
        .await;
    }
}
