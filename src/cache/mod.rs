use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

mod hot;
mod memory;
mod sweeper;

use hot::HotSet;
use memory::MemoryCache;
pub use memory::MemoryHit;

use crate::settings::Settings;

/// Coordinates the disk store (authoritative), the optional in-memory LRU
/// and the optional hot-set. Disk writes are temp-then-rename so a partially
/// written variant is never visible under its final name.
#[derive(Debug)]
pub struct Manager {
    base_dir: PathBuf,
    cache_dir: PathBuf,
    ttl: Duration,
    cleanup_interval: Duration,
    memory: Option<MemoryCache>,
    hot: Option<HotSet>,
}

impl Manager {
    pub fn new(settings: &Settings) -> Self {
        let memory = match settings.cache.memory_cache_size.0 {
            0 => None,
            limit => {
                let mut chunk = settings.cache.max_memory_chunk.0;
                if chunk == 0 || chunk > limit {
                    chunk = limit;
                }
                Some(MemoryCache::new(limit, chunk))
            }
        };
        let hot = match settings.cache.storage_hot_cache_size.0 {
            0 => None,
            limit => Some(HotSet::new(limit)),
        };
        Self {
            base_dir: PathBuf::from(&settings.storage.base_dir),
            cache_dir: PathBuf::from(&settings.storage.cache_dir),
            ttl: settings.cache.ttl.0,
            cleanup_interval: settings.cache.cleanup_interval.0,
            memory,
            hot,
        }
    }

    /// Creates the parent directories of a cache target; idempotent.
    pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(dir) if dir != Path::new("") => fs::create_dir_all(dir),
            _ => Ok(()),
        }
    }

    /// True iff the cache file exists, is not older than the original and is
    /// within TTL. A false result invalidates any memory-tier entry.
    pub fn is_fresh(&self, cache_path: &Path, origin_mtime: Option<SystemTime>) -> bool {
        let key = cache_key(cache_path);
        let info = match fs::metadata(cache_path) {
            Ok(info) => info,
            Err(_) => {
                self.evict_memory(&key);
                return false;
            }
        };
        let Ok(cache_mtime) = info.modified() else {
            self.evict_memory(&key);
            return false;
        };
        if origin_mtime.is_some_and(|origin| origin > cache_mtime) {
            self.evict_memory(&key);
            return false;
        }
        if !self.ttl.is_zero()
            && cache_mtime
                .elapsed()
                .map(|age| age > self.ttl)
                .unwrap_or(false)
        {
            self.evict_memory(&key);
            return false;
        }
        true
    }

    /// Writes the payload to a temporary sibling and renames it onto the
    /// target. On success the payload is mirrored into the memory tier and
    /// the hot-set is marked.
    pub fn write(&self, cache_path: &Path, payload: &[u8]) -> Result<()> {
        Self::ensure_parent(cache_path).context("ensure cache dir")?;
        let tmp = temp_sibling(cache_path);
        fs::write(&tmp, payload)
            .with_context(|| format!("write temp file {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, cache_path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("rename temp file onto {}", cache_path.display()));
        }
        if let Some(memory) = &self.memory
            && let Ok(info) = fs::metadata(cache_path)
            && let Ok(mtime) = info.modified()
        {
            let key = cache_key(cache_path);
            memory.store(&key, payload, mtime);
            self.mark_hot_key(&key, payload.len() as u64);
        }
        Ok(())
    }

    /// Opens a cache file and returns its handle and metadata.
    pub fn serve_stats(&self, cache_path: &Path) -> std::io::Result<(fs::File, fs::Metadata)> {
        let file = fs::File::open(cache_path)?;
        let info = file.metadata()?;
        Ok((file, info))
    }

    /// Opens and fully reads a cache file, returning the payload and its
    /// modification time.
    pub fn read_cached(&self, cache_path: &Path) -> std::io::Result<(Vec<u8>, SystemTime)> {
        let (mut file, info) = self.serve_stats(cache_path)?;
        let mtime = info.modified()?;
        let mut payload = Vec::with_capacity(info.len() as usize);
        file.read_to_end(&mut payload)?;
        Ok((payload, mtime))
    }

    /// Returns the cached payload from memory iff it is still fresh with
    /// respect to the original's mtime and TTL.
    pub fn load_memory(
        &self,
        cache_path: &Path,
        origin_mtime: Option<SystemTime>,
    ) -> Option<MemoryHit> {
        let memory = self.memory.as_ref()?;
        let key = cache_key(cache_path);
        let hit = memory.load(&key, origin_mtime, self.ttl)?;
        self.mark_hot_key(&key, hit.size);
        Some(hit)
    }

    /// Records that a cache path was served from disk so the sweeper can
    /// protect it.
    pub fn mark_hot(&self, cache_path: &Path, size: u64) {
        self.mark_hot_key(&cache_key(cache_path), size);
    }

    fn mark_hot_key(&self, key: &str, size: u64) {
        if size == 0 {
            return;
        }
        if let Some(hot) = &self.hot {
            hot.mark(key, size);
        }
    }

    fn evict_memory(&self, key: &str) {
        if let Some(memory) = &self.memory {
            memory.remove(key);
        }
    }

    /// Drops a removed file from both in-memory structures.
    fn drop_entry(&self, key: &str) {
        if let Some(memory) = &self.memory {
            memory.remove(key);
        }
        if let Some(hot) = &self.hot {
            hot.remove(key);
        }
    }

    fn protect_hot(&self, key: &str, size: u64) -> bool {
        match &self.hot {
            Some(hot) if size > 0 => hot.protect(key, size),
            _ => false,
        }
    }
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
