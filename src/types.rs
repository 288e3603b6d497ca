use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MagpieError, Result};

/// Ownership partition of an index: the single shared global scope, or one
/// scope per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Tenant(String),
}

impl Scope {
    /// Stable string key used for progress maps, log prefixes, and grouping.
    pub fn key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Tenant(id) => format!("users/{}", id),
        }
    }

    /// Directory of this scope's index relative to the index root.
    pub fn dir(&self, root: &std::path::Path) -> PathBuf {
        match self {
            Scope::Global => root.join("global"),
            Scope::Tenant(id) => root.join("users").join(id),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Tenant(id) => Some(id.as_str()),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Content categories are statically partitioned between the global index and
/// per-tenant indices. The pairing is a hard invariant enforced at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    /// Provider and model documentation ingested by the platform.
    ProviderDocs,
    /// Published pricing sheets for hosted models.
    PricingSheets,
    /// Help-center guides and onboarding articles.
    Guides,
    /// A tenant's conversation transcripts.
    Conversations,
    /// A tenant's saved prompts and templates.
    Prompts,
    /// Free-form usage annotations written by a tenant.
    UsageNotes,
}

impl ContentCategory {
    pub fn is_tenant_scoped(&self) -> bool {
        matches!(
            self,
            ContentCategory::Conversations | ContentCategory::Prompts | ContentCategory::UsageNotes
        )
    }

    /// All categories that land in the given scope's index.
    pub fn for_scope(scope: &Scope) -> Vec<ContentCategory> {
        let tenant = matches!(scope, Scope::Tenant(_));
        [
            ContentCategory::ProviderDocs,
            ContentCategory::PricingSheets,
            ContentCategory::Guides,
            ContentCategory::Conversations,
            ContentCategory::Prompts,
            ContentCategory::UsageNotes,
        ]
        .into_iter()
        .filter(|c| c.is_tenant_scoped() == tenant)
        .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::ProviderDocs => "provider_docs",
            ContentCategory::PricingSheets => "pricing_sheets",
            ContentCategory::Guides => "guides",
            ContentCategory::Conversations => "conversations",
            ContentCategory::Prompts => "prompts",
            ContentCategory::UsageNotes => "usage_notes",
        }
    }
}

/// Resolve the target scope for a write, enforcing the category/scope pairing.
///
/// A tenant-scoped category without a tenant id is rejected. A tenant id
/// supplied for a global-scope category is ignored with a warning — the write
/// still lands in the global index.
pub fn resolve_scope(category: ContentCategory, tenant_id: Option<&str>) -> Result<Scope> {
    match (category.is_tenant_scoped(), tenant_id) {
        (true, Some(id)) => Ok(Scope::Tenant(id.to_string())),
        (true, None) => Err(MagpieError::ScopeMismatch(format!(
            "category '{}' requires a tenant id",
            category.as_str()
        ))),
        (false, Some(id)) => {
            tracing::warn!(
                "tenant id '{}' ignored for global category '{}'",
                id,
                category.as_str()
            );
            Ok(Scope::Global)
        }
        (false, None) => Ok(Scope::Global),
    }
}

/// Where an embedded chunk came from in the source-of-truth store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_doc_id: String,
    pub chunk_index: u32,
    pub content_hash: String,
}

/// A content chunk bound for the ANN index. The canonical copy lives in the
/// source-of-truth store; this derived copy is reconstructible at any time.
///
/// `embedding` is `None` until computed — the write queue's apply step embeds
/// missing vectors in batch before they reach the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub id: String,
    pub category: ContentCategory,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub provenance: Provenance,
}

/// A record as the source-of-truth store holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub category: ContentCategory,
    pub tenant_id: Option<String>,
    pub text: String,
    pub chunk_index: u32,
    pub content_hash: String,
}

impl SourceDocument {
    /// Convert to the embedded form (vector still to be computed).
    pub fn to_embedded(&self) -> EmbeddedRecord {
        EmbeddedRecord {
            id: self.id.clone(),
            category: self.category,
            text: self.text.clone(),
            embedding: None,
            provenance: Provenance {
                source_doc_id: self.id.clone(),
                chunk_index: self.chunk_index,
                content_hash: self.content_hash.clone(),
            },
        }
    }
}

/// One ranked similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub doc_id: String,
    pub score: f32,
}

/// Point-in-time health assessment of one index. Computed on demand, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHealth {
    pub scope: Scope,
    pub path: PathBuf,
    pub exists: bool,
    pub checksum_valid: bool,
    pub document_count: usize,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub needs_rebuild: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Live progress of an in-flight rebuild. One per scope; dropped when the
/// rebuild finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub scope: Scope,
    pub total_documents: u64,
    pub processed_documents: u64,
    pub failed_documents: u64,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RecoveryProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_documents == 0 {
            return 100.0;
        }
        (self.processed_documents as f64 / self.total_documents as f64) * 100.0
    }
}

/// Outcome of applying one scope group's batch: fully applied, or applied
/// with a counted remainder of failures (best-effort, never all-or-nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(usize),
    Partial { applied: usize, failed: usize },
}

impl ApplyOutcome {
    pub fn applied(&self) -> usize {
        match self {
            ApplyOutcome::Applied(n) => *n,
            ApplyOutcome::Partial { applied, .. } => *applied,
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            ApplyOutcome::Applied(_) => 0,
            ApplyOutcome::Partial { failed, .. } => *failed,
        }
    }
}

/// Snapshot of write-queue counters, exposed for operational dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueStatsSnapshot {
    pub queue_depth: usize,
    pub batches_processed: u64,
    pub documents_processed: u64,
    pub failed_writes: u64,
    pub avg_batch_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}
