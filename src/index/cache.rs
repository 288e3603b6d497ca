//! Bounded cache of loaded tenant indices.
//!
//! Pure data structure: eviction *returns* the evicted entries so the caller
//! can flush them to disk. No I/O happens in here, which keeps the policy
//! testable in isolation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::index::ann::AnnIndex;

pub type CachedIndex = Arc<RwLock<AnnIndex>>;

struct CacheSlot {
    index: CachedIndex,
    last_access: Instant,
}

pub struct TenantCache {
    capacity: usize,
    ttl: Duration,
    slots: HashMap<String, CacheSlot>,
}

impl TenantCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        TenantCache {
            capacity: capacity.max(1),
            ttl,
            slots: HashMap::new(),
        }
    }

    pub fn get(&mut self, tenant_id: &str) -> Option<CachedIndex> {
        let slot = self.slots.get_mut(tenant_id)?;
        slot.last_access = Instant::now();
        Some(Arc::clone(&slot.index))
    }

    /// Insert a handle, returning any entries evicted to stay within
    /// capacity (least recently accessed first).
    pub fn insert(&mut self, tenant_id: String, index: CachedIndex) -> Vec<(String, CachedIndex)> {
        self.slots.insert(
            tenant_id,
            CacheSlot {
                index,
                last_access: Instant::now(),
            },
        );

        let mut evicted = Vec::new();
        while self.slots.len() > self.capacity {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    if let Some(slot) = self.slots.remove(&id) {
                        evicted.push((id, slot.index));
                    }
                }
                None => break,
            }
        }
        evicted
    }

    /// Remove entries idle past the TTL, returning them for flushing.
    pub fn sweep_expired(&mut self) -> Vec<(String, CachedIndex)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_access) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.slots.remove(&id).map(|slot| (id, slot.index)))
            .collect()
    }

    /// Look up a handle without refreshing its recency (health sampling).
    pub fn peek(&self, tenant_id: &str) -> Option<CachedIndex> {
        self.slots.get(tenant_id).map(|slot| Arc::clone(&slot.index))
    }

    /// Snapshot of every cached entry, recency untouched.
    pub fn entries(&self) -> Vec<(String, CachedIndex)> {
        self.slots
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(&slot.index)))
            .collect()
    }

    /// Drop an entry without returning it (tenant offboarding).
    pub fn remove(&mut self, tenant_id: &str) -> Option<CachedIndex> {
        self.slots.remove(tenant_id).map(|slot| slot.index)
    }

    /// Take every entry out of the cache (shutdown flush).
    pub fn drain_all(&mut self) -> Vec<(String, CachedIndex)> {
        self.slots
            .drain()
            .map(|(id, slot)| (id, slot.index))
            .collect()
    }

    /// Tenant ids ordered most recently accessed first.
    pub fn recently_accessed(&self, n: usize) -> Vec<String> {
        let mut ids: Vec<(&String, Instant)> = self
            .slots
            .iter()
            .map(|(id, slot)| (id, slot.last_access))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        ids.into_iter().take(n).map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.slots.contains_key(tenant_id)
    }
}
