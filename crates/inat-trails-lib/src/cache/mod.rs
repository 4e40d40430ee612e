//! Durable disk cache for retrieved payloads
//!
//! Every entry is one gzip-compressed JSON file named after its [`CacheKey`].
//! Writes go to a temporary sibling file which is renamed into place, so a
//! reader never observes a partially written entry. Entries older than the
//! TTL of their [`CacheKind`] are treated as missing and deleted by
//! [`DiskCache::sweep_expired`].
//!
//! Recently used payloads are additionally kept in memory (as uncompressed
//! JSON) so repeated lookups within one run skip the decompression.

mod key;

pub use key::{CacheKey, CacheKind};

use crate::Result;
use crate::config::CacheConfig;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lru::LruCache;
use serde::{Serialize, de::DeserializeOwned};
use std::fs;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Suffix of in-flight writes; such files are never read as entries
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepDecision {
    Remove,
    Keep,
    Skip,
    Failed,
}

/// Outcome of an expiration sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired entries and orphaned temporary files deleted
    pub removed: usize,
    /// Entries still within their TTL
    pub kept: usize,
    /// Deletions that failed (logged, not fatal)
    pub failed: usize,
}

struct HotEntry {
    written: SystemTime,
    json: Arc<Vec<u8>>,
}

/// Key-addressed, TTL-bounded, gzip-compressed store
pub struct DiskCache {
    config: CacheConfig,
    /// In-memory copy of recently used payloads
    hot: Option<Mutex<LruCache<CacheKey, HotEntry>>>,
    /// Distinguishes concurrent temporary files of this process
    write_counter: AtomicU64,
}

impl DiskCache {
    /// Open (and create if needed) the cache directory
    pub fn open(config: &CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;
        tracing::debug!("Using cache directory {}", config.directory.display());

        let hot = NonZeroUsize::new(config.hot_entries).map(|cap| Mutex::new(LruCache::new(cap)));
        Ok(Self {
            config: config.clone(),
            hot,
            write_counter: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Full path of the file backing `key`
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.config.directory.join(key.file_name())
    }

    /// Look up `key`; `Ok(None)` on a miss or an expired entry
    ///
    /// Entries that cannot be decompressed or decoded as `T` are deleted and
    /// reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cache::get");
        let now = SystemTime::now();

        if let Some(json) = self.hot_get(key, now) {
            match serde_json::from_slice(&json) {
                Ok(value) => {
                    tracing::debug!("Cache hit (memory) for {}", key);
                    return Ok(Some(value));
                }
                Err(e) => {
                    tracing::warn!("In-memory entry {} does not decode: {}", key, e);
                    self.hot_remove(key);
                }
            }
        }

        let path = self.path(key);
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Cache miss for {}", key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if self.is_expired(key.kind(), modified, now) {
            tracing::debug!("Cache entry {} expired", key);
            return Ok(None);
        }

        let json = match read_gz(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if is_corruption(&e) => {
                self.discard(key, &path, &e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&json) {
            Ok(value) => {
                tracing::debug!("Cache hit for {}", key);
                self.hot_put(key, modified, json);
                Ok(Some(value))
            }
            Err(e) => {
                self.discard(key, &path, &e);
                Ok(None)
            }
        }
    }

    /// Store `value` under `key`, replacing any previous entry
    ///
    /// On failure the temporary file is removed and the previous entry (if
    /// any) is left untouched.
    pub fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<()> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cache::put");
        let json = serde_json::to_vec(value)?;

        let path = self.path(key);
        let temp = self.temp_path(key);
        let written = write_gz(&temp, &json).and_then(|()| fs::rename(&temp, &path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp)
                && cleanup.kind() != ErrorKind::NotFound
            {
                tracing::warn!(
                    "Failed to remove temporary file {}: {}",
                    temp.display(),
                    cleanup
                );
            }
            return Err(e.into());
        }

        tracing::debug!("Cached {} ({} bytes of JSON)", key, json.len());
        self.hot_put(key, SystemTime::now(), json);
        Ok(())
    }

    /// Delete every entry whose age exceeds the TTL of its kind
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        self.sweep_expired_at(SystemTime::now())
    }

    /// Like [`Self::sweep_expired`], measuring ages relative to `now`
    ///
    /// Orphaned temporary files left by an interrupted write are removed as
    /// well. Files of unknown kind are left alone.
    pub fn sweep_expired_at(&self, now: SystemTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let own_marker = format!(".{}.", std::process::id());

        let entries = match fs::read_dir(&self.config.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Failed to read cache directory entry: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            let modified = || entry.metadata().and_then(|m| m.modified());
            match self.sweep_decision(file_name, modified, now, &own_marker) {
                SweepDecision::Keep => report.kept += 1,
                SweepDecision::Skip => {}
                SweepDecision::Failed => report.failed += 1,
                SweepDecision::Remove => match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        tracing::debug!("Removed expired cache file {}", file_name);
                        report.removed += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("Failed to remove expired cache file {}: {}", file_name, e);
                        report.failed += 1;
                    }
                },
            }
        }

        if report.removed > 0
            && let Some(hot) = &self.hot
        {
            hot.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }

        tracing::info!(
            "Cache sweep removed {} expired entries, kept {}, failed on {}",
            report.removed,
            report.kept,
            report.failed
        );
        Ok(report)
    }

    /// What the sweep does with one file of the cache directory
    ///
    /// `modified` is only consulted for entries of a known kind. A file that
    /// vanished in the meantime is skipped; any other failure to read its
    /// timestamp is logged and counted without stopping the sweep.
    fn sweep_decision(
        &self,
        file_name: &str,
        modified: impl FnOnce() -> io::Result<SystemTime>,
        now: SystemTime,
        own_marker: &str,
    ) -> SweepDecision {
        if file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX) {
            // In-flight writes of this process are not orphans
            return if file_name.contains(own_marker) {
                SweepDecision::Keep
            } else {
                SweepDecision::Remove
            };
        }
        let Some(kind) = CacheKind::from_file_name(file_name) else {
            return SweepDecision::Skip;
        };
        match modified() {
            Ok(modified) if self.is_expired(kind, modified, now) => SweepDecision::Remove,
            Ok(_) => SweepDecision::Keep,
            Err(e) if e.kind() == ErrorKind::NotFound => SweepDecision::Skip,
            Err(e) => {
                tracing::warn!("Failed to inspect cache file {}: {}", file_name, e);
                SweepDecision::Failed
            }
        }
    }

    fn is_expired(&self, kind: CacheKind, written: SystemTime, now: SystemTime) -> bool {
        // A timestamp in the future counts as fresh
        now.duration_since(written)
            .is_ok_and(|age| age > kind.ttl(&self.config))
    }

    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        let n = self.write_counter.fetch_add(1, Ordering::Relaxed);
        self.config.directory.join(format!(
            ".{}.{}.{}{}",
            key.file_name(),
            std::process::id(),
            n,
            TEMP_SUFFIX
        ))
    }

    fn discard(&self, key: &CacheKey, path: &Path, error: &dyn std::fmt::Display) {
        tracing::warn!("Discarding corrupt cache entry {}: {}", key, error);
        self.hot_remove(key);
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove corrupt cache entry {}: {}", key, e);
        }
    }

    fn hot_get(&self, key: &CacheKey, now: SystemTime) -> Option<Arc<Vec<u8>>> {
        let mut hot = self.hot.as_ref()?.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = hot.get(key)?;
        if self.is_expired(key.kind(), entry.written, now) {
            hot.pop(key);
            return None;
        }
        Some(Arc::clone(&entry.json))
    }

    fn hot_put(&self, key: &CacheKey, written: SystemTime, json: Vec<u8>) {
        if let Some(hot) = &self.hot {
            let entry = HotEntry {
                written,
                json: Arc::new(json),
            };
            hot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(key.clone(), entry);
        }
    }

    fn hot_remove(&self, key: &CacheKey) {
        if let Some(hot) = &self.hot {
            hot.lock().unwrap_or_else(PoisonError::into_inner).pop(key);
        }
    }
}

fn read_gz(path: &Path) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(BufReader::new(fs::File::open(path)?));
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(json)
}

fn write_gz(path: &Path, json: &[u8]) -> io::Result<()> {
    let file = fs::File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(json)?;
    let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

fn is_corruption(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof
    )
}
