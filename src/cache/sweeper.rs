use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tokio::task;
use tracing::{error, info, warn};

use crate::util::format_bytes;

use super::{Manager, cache_key};

const ALLOWED_CACHE_EXTENSIONS: [&str; 4] = ["png", "avif", "webp", "jpg"];

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct SweepStats {
    pub files: u64,
    pub bytes: u64,
    pub hot_preserved: u64,
    pub hot_bytes: u64,
}

impl Manager {
    /// Launches the periodic cleanup task: one sweep immediately, then one
    /// per `cleanup_interval`. An interval of zero disables the sweeper.
    /// The sweep in progress stops between file visits once the shutdown
    /// channel fires.
    pub fn start_sweeper(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.cleanup_interval;
        if interval.is_zero() {
            return;
        }
        let manager = self;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let cancel = cancel.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = shutdown.changed().await;
                cancel.store(true, Ordering::Relaxed);
            });
        }
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let manager = manager.clone();
                        let cancel = cancel.clone();
                        let outcome =
                            task::spawn_blocking(move || manager.sweep_once(&cancel)).await;
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => error!(error = %err, "cache cleanup failed"),
                            Err(err) => error!(error = %err, "cache cleanup task failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    pub(super) fn sweep_once(&self, cancel: &AtomicBool) -> Result<()> {
        let root = self.cache_dir.clone();
        match fs::metadata(&root) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        info!(root = %root.display(), "cache cleanup started");

        let mut stats = SweepStats::default();
        let mut dirs = Vec::with_capacity(16);
        self.visit_dir(&root, cancel, &mut dirs, &mut stats)?;

        for dir in dirs.iter().rev() {
            if *dir == root {
                continue;
            }
            remove_dir_if_empty(dir);
        }
        remove_dir_if_empty(&root);

        crate::metrics::record_sweep(stats.files, stats.bytes);
        if stats.hot_preserved > 0 {
            info!(
                files_removed = stats.files,
                bytes_removed = %format_bytes(stats.bytes),
                raw_bytes_removed = stats.bytes,
                hot_retained = stats.hot_preserved,
                hot_bytes_retained = %format_bytes(stats.hot_bytes),
                raw_hot_bytes_retained = stats.hot_bytes,
                "cache cleanup finished"
            );
        } else {
            info!(
                files_removed = stats.files,
                bytes_removed = %format_bytes(stats.bytes),
                raw_bytes_removed = stats.bytes,
                "cache cleanup finished"
            );
        }
        Ok(())
    }

    /// Depth-first walk collecting directories in discovery order; files are
    /// processed in place, per-file errors logged and skipped.
    fn visit_dir(
        &self,
        dir: &Path,
        cancel: &AtomicBool,
        dirs: &mut Vec<PathBuf>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        dirs.push(dir.to_path_buf());
        let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.visit_dir(&entry.path(), cancel, dirs, stats)?;
                continue;
            }
            if cancel.load(Ordering::Relaxed) {
                bail!("cache cleanup cancelled");
            }
            if !file_type.is_file() {
                continue;
            }
            self.sweep_file(&entry.path(), stats);
        }
        Ok(())
    }

    fn sweep_file(&self, path: &Path, stats: &mut SweepStats) {
        if !has_allowed_cache_extension(path) {
            return;
        }
        let info = match fs::metadata(path) {
            Ok(info) => info,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stat cache file");
                return;
            }
        };
        let Ok(cache_mtime) = info.modified() else {
            return;
        };

        let expired = !self.ttl.is_zero()
            && cache_mtime
                .elapsed()
                .map(|age| age > self.ttl)
                .unwrap_or(false);
        if expired {
            if self.should_keep_hot(path, info.len(), stats) {
                return;
            }
            if let Err(err) = self.remove_cache_file(path, info.len(), stats) {
                warn!(path = %path.display(), error = %err, "remove stale cache");
            }
            return;
        }

        let Some((_geometry, rel)) = split_cache_path(&self.cache_dir, path) else {
            return;
        };
        match self.lookup_original_mtime(&rel) {
            Ok(origin_mtime) => {
                if origin_mtime > cache_mtime
                    && let Err(err) = self.remove_cache_file(path, info.len(), stats)
                {
                    warn!(path = %path.display(), error = %err, "remove outdated cache");
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if let Err(err) = self.remove_cache_file(path, info.len(), stats) {
                    warn!(path = %path.display(), error = %err, "remove orphan cache");
                }
            }
            Err(_) => {}
        }
    }

    /// Stats the presumed original under `base_dir`. A missing original is
    /// retried with the last extension stripped, supporting double-extension
    /// variants whose base file is the true source.
    fn lookup_original_mtime(&self, rel: &str) -> std::io::Result<SystemTime> {
        let original = self.base_dir.join(rel);
        let err = match fs::metadata(&original) {
            Ok(info) => return info.modified(),
            Err(err) if err.kind() == ErrorKind::NotFound => err,
            Err(err) => return Err(err),
        };
        let Some(trimmed) = strip_last_extension(rel) else {
            return Err(err);
        };
        match fs::metadata(self.base_dir.join(trimmed)) {
            Ok(info) => info.modified(),
            Err(fallback_err) if fallback_err.kind() == ErrorKind::NotFound => Err(err),
            Err(fallback_err) => Err(fallback_err),
        }
    }

    fn should_keep_hot(&self, path: &Path, size: u64, stats: &mut SweepStats) -> bool {
        if !self.protect_hot(&cache_key(path), size) {
            return false;
        }
        stats.hot_preserved += 1;
        stats.hot_bytes += size;
        true
    }

    fn remove_cache_file(&self, path: &Path, size: u64, stats: &mut SweepStats) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        stats.files += 1;
        stats.bytes += size;
        self.drop_entry(&cache_key(path));
        Ok(())
    }
}

fn has_allowed_cache_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_CACHE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Splits a cache file path into its geometry prefix and the remaining
/// relative path. Files directly under the cache root have no geometry
/// component and are ignored.
fn split_cache_path(cache_root: &Path, candidate: &Path) -> Option<(String, String)> {
    let rel = candidate.strip_prefix(cache_root).ok()?;
    let mut components = rel.iter();
    let geometry = components.next()?.to_str()?.to_string();
    let remainder: Vec<&str> = components.map(|part| part.to_str()).collect::<Option<_>>()?;
    if remainder.is_empty() {
        return None;
    }
    Some((geometry, remainder.join("/")))
}

fn strip_last_extension(rel: &str) -> Option<&str> {
    let ext = Path::new(rel).extension()?.to_str()?;
    rel.strip_suffix(ext)?.strip_suffix('.')
}

fn remove_dir_if_empty(dir: &Path) {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "inspect cache dir");
            return;
        }
    };
    if entries.next().is_some() {
        return;
    }
    if let Err(err) = fs::remove_dir(dir)
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %dir.display(), error = %err, "remove cache dir");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ByteSize, HumanDuration, Settings};
    use std::time::Duration;
    use tempfile::TempDir;

    fn build_manager(dir: &TempDir, configure: impl FnOnce(&mut Settings)) -> Manager {
        let mut settings = Settings {
            server: Default::default(),
            storage: Default::default(),
            resize: Default::default(),
            cache: Default::default(),
            rewrites: Vec::new(),
            log: crate::cli::LogFormat::Text,
            metrics_listen: None,
        };
        settings.storage.base_dir = dir.path().join("base").display().to_string();
        settings.storage.cache_dir = dir.path().join("cache").display().to_string();
        settings.cache.ttl = HumanDuration(Duration::ZERO);
        configure(&mut settings);
        fs::create_dir_all(&settings.storage.base_dir).unwrap();
        fs::create_dir_all(&settings.storage.cache_dir).unwrap();
        Manager::new(&settings)
    }

    fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn removes_orphans_and_prunes_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        let orphan = dir.path().join("cache/200x200/gone/a.jpg");
        write_file(&orphan, b"stale");

        manager.sweep_once(&no_cancel()).unwrap();

        assert!(!orphan.exists());
        assert!(!dir.path().join("cache/200x200").exists());
        assert!(dir.path().join("cache").exists(), "cache root is kept");
    }

    #[test]
    fn keeps_entries_whose_original_exists() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        write_file(&dir.path().join("base/a.jpg"), b"original");
        let cached = dir.path().join("cache/200x200/a.jpg");
        write_file(&cached, b"variant");

        manager.sweep_once(&no_cancel()).unwrap();
        assert!(cached.exists());
    }

    #[test]
    fn keeps_double_extension_entries_via_fallback_base() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        write_file(&dir.path().join("base/a.jpg"), b"original");
        let cached = dir.path().join("cache/200x200/a.jpg.webp");
        write_file(&cached, b"variant");

        manager.sweep_once(&no_cancel()).unwrap();
        assert!(cached.exists(), "base file a.jpg is the true source");
    }

    #[test]
    fn removes_outdated_entries() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        let original = dir.path().join("base/a.jpg");
        write_file(&original, b"original");
        let cached = dir.path().join("cache/200x200/a.jpg");
        write_file(&cached, b"variant");
        set_mtime(&cached, SystemTime::now() - Duration::from_secs(600));

        manager.sweep_once(&no_cancel()).unwrap();
        assert!(!cached.exists());
    }

    #[test]
    fn ttl_expiry_removes_unprotected_entries() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |settings| {
            settings.cache.ttl = HumanDuration(Duration::from_secs(60));
        });
        write_file(&dir.path().join("base/a.jpg"), b"original");
        let cached = dir.path().join("cache/200x200/a.jpg");
        write_file(&cached, b"variant");
        set_mtime(&cached, SystemTime::now() - Duration::from_secs(120));

        manager.sweep_once(&no_cancel()).unwrap();
        assert!(!cached.exists());
    }

    #[test]
    fn hot_set_protects_expired_entries() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |settings| {
            settings.cache.ttl = HumanDuration(Duration::from_secs(60));
            settings.cache.storage_hot_cache_size = ByteSize(1024);
        });
        write_file(&dir.path().join("base/a.jpg"), b"original");
        let cached = dir.path().join("cache/200x200/a.jpg");
        write_file(&cached, b"variant");
        set_mtime(&cached, SystemTime::now() - Duration::from_secs(120));

        manager.mark_hot(&cached, 7);
        manager.sweep_once(&no_cancel()).unwrap();
        assert!(cached.exists(), "hot entries survive TTL expiry");

        // Without the hot marking the same file is collected.
        let manager = build_manager(&dir, |settings| {
            settings.cache.ttl = HumanDuration(Duration::from_secs(60));
            settings.cache.storage_hot_cache_size = ByteSize(1024);
        });
        manager.sweep_once(&no_cancel()).unwrap();
        assert!(!cached.exists());
    }

    #[test]
    fn ignores_files_with_unknown_extensions() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        let stray = dir.path().join("cache/200x200/notes.txt");
        write_file(&stray, b"unmanaged");

        manager.sweep_once(&no_cancel()).unwrap();
        assert!(stray.exists());
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let dir = TempDir::new().unwrap();
        let manager = build_manager(&dir, |_| {});
        let cached = dir.path().join("cache/200x200/a.jpg");
        write_file(&cached, b"variant");

        let cancelled = AtomicBool::new(true);
        assert!(manager.sweep_once(&cancelled).is_err());
        assert!(cached.exists(), "no file is visited after cancellation");
    }

    #[test]
    fn splits_geometry_and_relative_path() {
        let root = Path::new("/cache");
        assert_eq!(
            split_cache_path(root, Path::new("/cache/200x200/img/a.jpg")),
            Some(("200x200".to_string(), "img/a.jpg".to_string()))
        );
        assert_eq!(split_cache_path(root, Path::new("/cache/a.jpg")), None);
        assert_eq!(split_cache_path(Path::new("/other"), Path::new("/cache/a.jpg")), None);
    }

    #[test]
    fn strips_only_the_last_extension() {
        assert_eq!(strip_last_extension("img/a.jpg.webp"), Some("img/a.jpg"));
        assert_eq!(strip_last_extension("img/a.jpg"), Some("img/a"));
        assert_eq!(strip_last_extension("img/a"), None);
    }
}
