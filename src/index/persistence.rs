//! Crash-safe index persistence.
//!
//! Saves go through a uniquely named temp directory which is renamed into
//! place only after the serialized structure and its checksum are fully
//! written; the previous version is demoted to a `*_backup` sibling first.
//! A reader therefore never observes a half-written index directory.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{MagpieError, Result};
use crate::index::ann::{AnnIndex, INDEX_FILE};

/// File holding the hex SHA-256 of the serialized index file.
pub const CHECKSUM_FILE: &str = "checksum.txt";

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MagpieError::InvalidPath(format!("{}", dir.display())))?;
    let parent = dir
        .parent()
        .ok_or_else(|| MagpieError::InvalidPath(format!("{}", dir.display())))?;
    Ok(parent.join(format!("{name}{suffix}")))
}

/// Hex SHA-256 of a file's contents.
pub fn checksum_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Atomically persist `index` into `dir`.
///
/// Any failure removes the temp directory and leaves the prior version
/// untouched.
pub fn save_atomic(index: &AnnIndex, dir: &Path) -> Result<()> {
    let temp = sibling(dir, &format!("_temp_{}", epoch_millis()))?;
    let backup = sibling(dir, "_backup")?;

    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = (|| -> Result<()> {
        index.write_files(&temp)?;
        let checksum = checksum_file(&temp.join(INDEX_FILE))?;
        std::fs::write(temp.join(CHECKSUM_FILE), &checksum)?;

        if dir.exists() {
            if backup.exists() {
                std::fs::remove_dir_all(&backup)?;
            }
            std::fs::rename(dir, &backup)?;
        }
        std::fs::rename(&temp, dir)?;
        Ok(())
    })();

    if result.is_err() && temp.exists() {
        let _ = std::fs::remove_dir_all(&temp);
    }
    result
}

/// Whether the stored checksum matches a freshly computed one.
///
/// A missing checksum file is tolerated (older layouts) and treated as valid;
/// a missing index file is not.
pub fn verify_checksum(dir: &Path) -> Result<bool> {
    let index_path = dir.join(INDEX_FILE);
    if !index_path.exists() {
        return Ok(false);
    }
    let checksum_path = dir.join(CHECKSUM_FILE);
    if !checksum_path.exists() {
        return Ok(true);
    }
    let stored = std::fs::read_to_string(&checksum_path)?;
    let actual = checksum_file(&index_path)?;
    Ok(stored.trim() == actual)
}

/// Load an index from `dir`, refusing checksum mismatches.
///
/// Returns `Ok(None)` when no index directory exists. A corrupt index is an
/// [`MagpieError::IndexLoad`] — callers fall back to a fresh index and flag a
/// rebuild rather than crash.
pub fn load_verified(dir: &Path, scope_key: &str) -> Result<Option<AnnIndex>> {
    if !dir.exists() {
        return Ok(None);
    }
    if !verify_checksum(dir)? {
        return Err(MagpieError::IndexLoad {
            scope: scope_key.to_string(),
            reason: "checksum mismatch".into(),
        });
    }
    match AnnIndex::read_files(dir) {
        Ok(idx) => Ok(Some(idx)),
        Err(e) => Err(MagpieError::IndexLoad {
            scope: scope_key.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Document count recorded in an index directory's metadata, without loading
/// the HNSW structure. Excludes the bootstrap placeholder.
pub fn stored_document_count(dir: &Path) -> Option<usize> {
    let meta_json = std::fs::read_to_string(dir.join(super::ann::META_FILE)).ok()?;
    let meta: serde_json::Value = serde_json::from_str(&meta_json).ok()?;
    let map = meta.get("doc_to_key")?.as_object()?;
    let seeded = map.contains_key(super::ann::BOOTSTRAP_DOC_ID) as usize;
    Some(map.len() - seeded)
}

/// Total size in bytes of the files inside an index directory.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Last-modified time of the serialized index file, if present.
pub fn last_modified(dir: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
    let meta = std::fs::metadata(dir.join(INDEX_FILE)).ok()?;
    let mtime = meta.modified().ok()?;
    Some(chrono::DateTime::<chrono::Utc>::from(mtime))
}
