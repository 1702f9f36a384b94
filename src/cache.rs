//! Disk Memoization
//!
//! The merged taxonomy and the taxonomy-derived entity patterns are the two
//! expensive one-time setup steps, so both are cached to disk keyed by a
//! content hash of the source reference files.
//!
//! The policy is lock-free: check cache file existence, else compute and
//! write. Concurrent first-time builds may recompute redundantly; the write
//! is idempotent and last-writer-wins on the cache file.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Hex content hash over a set of source files, in argument order.
///
/// Used as the cache key so edits to any reference file invalidate the
/// cached artifacts derived from it.
pub fn content_hash(paths: &[&Path]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read file for cache key: {:?}", path))?;
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Load a cached artifact, or build and cache it.
///
/// A cache file that fails to parse is treated as absent (stale format from
/// an older build) and rebuilt in place.
pub fn load_or_build<T, F>(cache_path: &Path, build: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    if cache_path.is_file() {
        let contents = fs::read_to_string(cache_path)
            .with_context(|| format!("Failed to read cache file: {:?}", cache_path))?;
        match serde_json::from_str(&contents) {
            Ok(value) => {
                tracing::debug!("Loaded cached artifact: {:?}", cache_path);
                return Ok(value);
            }
            Err(err) => {
                tracing::warn!("Stale cache at {:?} ({}), rebuilding", cache_path, err);
            }
        }
    }

    let value = build()?;

    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache dir: {:?}", parent))?;
    }
    let serialized = serde_json::to_string(&value).with_context(|| "Failed to serialize cache")?;
    // A concurrent writer may race us here; both write the same content.
    if let Err(err) = fs::write(cache_path, serialized) {
        tracing::warn!("Failed to write cache file {:?}: {}", cache_path, err);
    } else {
        tracing::info!("Wrote cache file: {:?}", cache_path);
    }

    Ok(value)
}
