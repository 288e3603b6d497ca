use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Migration phase between the source-of-truth search path and the ANN path.
/// Runtime-switchable; read once per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// All reads and writes go to the source-of-truth store only.
    StoreOnly,
    /// Writes go to both stores (source of truth first); reads to the store.
    DualWrite,
    /// Dual writes, plus shadow reads against the ANN index for divergence
    /// metrics. Callers always get the store result.
    ShadowRead,
    /// ANN index is primary; the store is a transparent read fallback.
    AnnPrimary,
}

impl RoutingMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "store-only" => Some(RoutingMode::StoreOnly),
            "dual-write" => Some(RoutingMode::DualWrite),
            "shadow-read" => Some(RoutingMode::ShadowRead),
            "ann-primary" => Some(RoutingMode::AnnPrimary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub index_root: PathBuf,
    pub embedding_dimensions: usize,
    pub max_cached_tenant_indices: usize,
    pub tenant_cache_ttl_secs: u64,
    pub write_batch_size: usize,
    pub write_batch_timeout_ms: u64,
    pub write_max_retries: u32,
    pub write_retry_base_ms: u64,
    pub auto_save: bool,
    pub routing_mode: RoutingMode,
    pub divergence_threshold: f64,
    pub divergence_history_cap: usize,
    pub health_check_interval_secs: u64,
    pub discrepancy_soft_pct: f64,
    pub discrepancy_hard_pct: f64,
    pub memory_threshold_pct: f64,
    pub auto_recovery: bool,
    pub max_concurrent_rebuilds: usize,
    pub rebuild_batch_size: usize,
    pub rebuild_docs_per_sec: f64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        VectorStoreConfig {
            index_root: PathBuf::from("./data/vector-index"),
            embedding_dimensions: 384,
            max_cached_tenant_indices: 100,
            tenant_cache_ttl_secs: 3600,
            write_batch_size: 50,
            write_batch_timeout_ms: 100,
            write_max_retries: 3,
            write_retry_base_ms: 200,
            auto_save: true,
            routing_mode: RoutingMode::DualWrite,
            divergence_threshold: 0.7,
            divergence_history_cap: 1000,
            health_check_interval_secs: 86_400,
            discrepancy_soft_pct: 5.0,
            discrepancy_hard_pct: 10.0,
            memory_threshold_pct: 80.0,
            auto_recovery: false,
            max_concurrent_rebuilds: 3,
            rebuild_batch_size: 100,
            rebuild_docs_per_sec: 5.0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl VectorStoreConfig {
    pub fn from_env() -> Self {
        let d = VectorStoreConfig::default();
        VectorStoreConfig {
            index_root: env::var("MAGPIE_INDEX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.index_root),
            embedding_dimensions: env_parse("MAGPIE_EMBEDDING_DIMENSIONS", d.embedding_dimensions),
            max_cached_tenant_indices: env_parse(
                "MAGPIE_MAX_CACHED_TENANT_INDICES",
                d.max_cached_tenant_indices,
            ),
            tenant_cache_ttl_secs: env_parse("MAGPIE_TENANT_CACHE_TTL_SECS", d.tenant_cache_ttl_secs),
            write_batch_size: env_parse("MAGPIE_WRITE_BATCH_SIZE", d.write_batch_size),
            write_batch_timeout_ms: env_parse(
                "MAGPIE_WRITE_BATCH_TIMEOUT_MS",
                d.write_batch_timeout_ms,
            ),
            write_max_retries: env_parse("MAGPIE_WRITE_MAX_RETRIES", d.write_max_retries),
            write_retry_base_ms: env_parse("MAGPIE_WRITE_RETRY_BASE_MS", d.write_retry_base_ms),
            auto_save: env_parse("MAGPIE_AUTO_SAVE", d.auto_save),
            routing_mode: env::var("MAGPIE_ROUTING_MODE")
                .ok()
                .and_then(|s| RoutingMode::parse(&s))
                .unwrap_or(d.routing_mode),
            divergence_threshold: env_parse("MAGPIE_DIVERGENCE_THRESHOLD", d.divergence_threshold),
            divergence_history_cap: env_parse(
                "MAGPIE_DIVERGENCE_HISTORY_CAP",
                d.divergence_history_cap,
            ),
            health_check_interval_secs: env_parse(
                "MAGPIE_HEALTH_CHECK_INTERVAL_SECS",
                d.health_check_interval_secs,
            ),
            discrepancy_soft_pct: env_parse("MAGPIE_DISCREPANCY_SOFT_PCT", d.discrepancy_soft_pct),
            discrepancy_hard_pct: env_parse("MAGPIE_DISCREPANCY_HARD_PCT", d.discrepancy_hard_pct),
            memory_threshold_pct: env_parse("MAGPIE_MEMORY_THRESHOLD_PCT", d.memory_threshold_pct),
            auto_recovery: env_parse("MAGPIE_AUTO_RECOVERY", d.auto_recovery),
            max_concurrent_rebuilds: env_parse(
                "MAGPIE_MAX_CONCURRENT_REBUILDS",
                d.max_concurrent_rebuilds,
            ),
            rebuild_batch_size: env_parse("MAGPIE_REBUILD_BATCH_SIZE", d.rebuild_batch_size),
            rebuild_docs_per_sec: env_parse("MAGPIE_REBUILD_DOCS_PER_SEC", d.rebuild_docs_per_sec),
        }
    }
}
