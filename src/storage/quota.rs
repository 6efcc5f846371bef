// Storage quota enforcement
//
// Keeps the archive under its size cap by deleting the oldest segments first,
// across all cameras. Also sweeps export workspaces left behind by a crash.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::{scan_segments, Result, SegmentFile, StorageError};
use crate::config::Config;
use crate::export::TEMP_EXPORT_PREFIX;

/// Quota enforcer settings
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub video_dir: PathBuf,
    pub cap_bytes: u64,
    pub enforce_interval: Duration,
    pub usage_cache: Duration,
}

impl StorageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_dir: config.video_dir.clone(),
            cap_bytes: config.storage_cap_bytes(),
            enforce_interval: Duration::from_secs(config.storage.enforce_interval_secs.max(1)),
            usage_cache: Duration::from_secs(config.storage.usage_cache_secs),
        }
    }
}

/// Outcome of one enforcement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforceReport {
    /// Archive size before any deletion
    pub scanned_bytes: u64,
    /// Archive size after the pass
    pub remaining_bytes: u64,
    pub deleted: Vec<PathBuf>,
    /// Deletions that failed and were skipped
    pub failed: usize,
}

/// Archive usage as reported to clients
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageStats {
    pub used_bytes: u64,
    pub cap_bytes: u64,
    pub percent: f64,
    /// Size of the filesystem holding the archive, if known
    pub disk_total_bytes: Option<u64>,
    pub disk_available_bytes: Option<u64>,
}

/// Sort segments oldest first; ties broken by path
pub fn sort_oldest_first(files: &mut [SegmentFile]) {
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
}

/// Which files must go, oldest first, for the total to fit under `cap`
pub fn plan_evictions(files: &[SegmentFile], cap: u64) -> Vec<SegmentFile> {
    let mut total: u64 = files.iter().map(|f| f.size).sum();
    if total <= cap {
        return Vec::new();
    }

    let mut sorted = files.to_vec();
    sort_oldest_first(&mut sorted);

    let mut plan = Vec::new();
    for file in sorted {
        if total <= cap {
            break;
        }
        total = total.saturating_sub(file.size);
        plan.push(file);
    }
    plan
}

pub struct StorageManager {
    settings: StorageSettings,
    /// Last computed usage and when it was computed
    usage_cache: Mutex<Option<(Instant, u64)>>,
    /// Last filesystem figures, refreshed on the same schedule as usage
    disk_cache: Mutex<Option<(Instant, Option<(u64, u64)>)>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    enforcer: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    pub fn new(settings: StorageSettings) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        Self {
            settings,
            usage_cache: Mutex::new(None),
            disk_cache: Mutex::new(None),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            enforcer: Mutex::new(None),
        }
    }

    pub fn video_dir(&self) -> &Path {
        &self.settings.video_dir
    }

    pub fn cap_bytes(&self) -> u64 {
        self.settings.cap_bytes
    }

    /// Delete oldest segments until the archive fits under the cap
    pub fn enforce_cap(&self) -> EnforceReport {
        self.enforce_with(|path| std::fs::remove_file(path))
    }

    fn enforce_with(&self, remove: impl Fn(&Path) -> std::io::Result<()>) -> EnforceReport {
        let mut candidates = scan_segments(&self.settings.video_dir);
        let scanned: u64 = candidates.iter().map(|f| f.size).sum();
        let cap = self.settings.cap_bytes;

        let mut report = EnforceReport {
            scanned_bytes: scanned,
            remaining_bytes: scanned,
            ..Default::default()
        };

        if scanned > cap {
            log::info!(
                "[Storage] Archive at {:.1} MB exceeds cap of {:.1} MB, removing oldest segments",
                bytes_to_mb(scanned),
                bytes_to_mb(cap)
            );
        }

        // Files that could not be deleted still count against the cap, so
        // each failure replans over what is left
        let mut stuck_bytes: u64 = 0;
        loop {
            let plan = plan_evictions(&candidates, cap.saturating_sub(stuck_bytes));
            if plan.is_empty() {
                break;
            }

            let mut handled = HashSet::new();
            for file in plan {
                handled.insert(file.path.clone());
                match remove(&file.path) {
                    Ok(()) => {
                        log::info!(
                            "[Storage] Deleted {} ({:.1} MB)",
                            file.path.display(),
                            bytes_to_mb(file.size)
                        );
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        log::debug!("[Storage] {} already gone", file.path.display());
                    }
                    Err(e) => {
                        log::warn!("[Storage] Failed to delete {}: {}", file.path.display(), e);
                        report.failed += 1;
                        stuck_bytes += file.size;
                        break;
                    }
                }
                report.remaining_bytes = report.remaining_bytes.saturating_sub(file.size);
                report.deleted.push(file.path);
            }
            candidates.retain(|f| !handled.contains(&f.path));
        }

        self.store_usage(report.remaining_bytes);
        report
    }

    /// Current usage, served from cache when fresh
    pub fn usage(&self) -> StorageStats {
        let used = self.used_bytes();
        let cap = self.settings.cap_bytes;
        let percent = if cap == 0 { 0.0 } else { used as f64 / cap as f64 * 100.0 };
        let (disk_total_bytes, disk_available_bytes) = match self.disk_figures() {
            Some((total, available)) => (Some(total), Some(available)),
            None => (None, None),
        };

        StorageStats {
            used_bytes: used,
            cap_bytes: cap,
            percent,
            disk_total_bytes,
            disk_available_bytes,
        }
    }

    fn used_bytes(&self) -> u64 {
        let mut cache = self.usage_cache.lock();
        if let Some((at, bytes)) = *cache {
            if at.elapsed() < self.settings.usage_cache {
                return bytes;
            }
        }

        let bytes = scan_segments(&self.settings.video_dir).iter().map(|f| f.size).sum();
        *cache = Some((Instant::now(), bytes));
        bytes
    }

    fn disk_figures(&self) -> Option<(u64, u64)> {
        let mut cache = self.disk_cache.lock();
        if let Some((at, figures)) = *cache {
            if at.elapsed() < self.settings.usage_cache {
                return figures;
            }
        }

        let figures = disk_space(&self.settings.video_dir);
        *cache = Some((Instant::now(), figures));
        figures
    }

    fn store_usage(&self, bytes: u64) {
        *self.usage_cache.lock() = Some((Instant::now(), bytes));
    }

    /// Remove every export workspace directly under the archive root
    pub fn cleanup_temp_export_dirs(&self) -> usize {
        remove_temp_export_dirs(&self.settings.video_dir)
    }

    /// Run `enforce_cap` now and then every `enforce_interval` until `stop`
    pub fn spawn_enforcer(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.enforcer.lock();
        if slot.is_some() {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let stop_rx = self.stop_rx.clone();
        let ticker = tick(self.settings.enforce_interval);

        let handle = std::thread::Builder::new()
            .name("dashcam-storage-quota".into())
            .spawn(move || {
                log::info!(
                    "[Storage] Enforcing {:.1} GB cap every {:?}",
                    manager.settings.cap_bytes as f64 / crate::config::BYTES_PER_GB as f64,
                    manager.settings.enforce_interval
                );
                manager.enforce_cap();
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            manager.enforce_cap();
                        }
                    }
                }
                log::info!("[Storage] Quota enforcer stopped");
            })
            .map_err(|e| StorageError::Thread(e.to_string()))?;

        *slot = Some(handle);
        Ok(())
    }

    /// Stop the enforcer thread and wait for it
    pub fn stop(&self) {
        self.stop_tx.lock().take();
        if let Some(handle) = self.enforcer.lock().take() {
            if handle.join().is_err() {
                log::error!("[Storage] Quota enforcer panicked");
            }
        }
    }
}

/// Remove `.temp_export_*` directories under `video_dir`, returning how many went
pub fn remove_temp_export_dirs(video_dir: &Path) -> usize {
    let entries = match std::fs::read_dir(video_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(TEMP_EXPORT_PREFIX) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                log::info!("[Storage] Removed stale export workspace {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("[Storage] Failed to remove {}: {}", path.display(), e),
        }
    }
    removed
}

/// Total and available bytes of the filesystem holding `path`
fn disk_space(path: &Path) -> Option<(u64, u64)> {
    let path = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.total_space(), disk.available_space()))
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;

    fn segment(name: &str, size: u64, age_secs: u64) -> SegmentFile {
        SegmentFile {
            path: PathBuf::from(name),
            camera_id: "cam".into(),
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(10_000 - age_secs),
        }
    }

    fn settings(dir: &Path, cap_bytes: u64) -> StorageSettings {
        StorageSettings {
            video_dir: dir.to_path_buf(),
            cap_bytes,
            enforce_interval: Duration::from_millis(20),
            usage_cache: Duration::from_secs(60),
        }
    }

    fn write_segment(root: &Path, camera: &str, name: &str, size: usize, age_secs: u64) -> PathBuf {
        let dir = root.join(camera);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn under_cap_plans_nothing() {
        let files = vec![segment("a", 40, 3), segment("b", 40, 2)];
        assert!(plan_evictions(&files, 100).is_empty());
        assert!(plan_evictions(&files, 80).is_empty());
    }

    #[test]
    fn plan_removes_oldest_until_under_cap() {
        let files = vec![segment("c", 40, 1), segment("a", 40, 3), segment("b", 40, 2)];
        let plan = plan_evictions(&files, 100);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path, PathBuf::from("a"));

        let plan = plan_evictions(&files, 0);
        let order: Vec<_> = plan.iter().map(|f| f.path.to_str().unwrap()).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn equal_mtimes_evict_by_path() {
        let files = vec![segment("z", 10, 5), segment("m", 10, 5)];
        let plan = plan_evictions(&files, 10);
        assert_eq!(plan[0].path, PathBuf::from("m"));
    }

    #[test]
    fn enforce_deletes_oldest_across_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let oldest = write_segment(root, "rear", "rear_2024-01-01_00-00-00-000.mjpeg", 40, 300);
        let middle = write_segment(root, "front", "front_2024-01-01_00-01-00-000.mjpeg", 40, 200);
        let newest = write_segment(root, "rear", "rear_2024-01-01_00-02-00-000.mjpeg", 40, 100);

        let manager = StorageManager::new(settings(root, 100));
        let report = manager.enforce_cap();

        assert_eq!(report.scanned_bytes, 120);
        assert_eq!(report.remaining_bytes, 80);
        assert_eq!(report.deleted, vec![oldest.clone()]);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());

        let again = manager.enforce_cap();
        assert!(again.deleted.is_empty());
        assert_eq!(again.remaining_bytes, 80);
    }

    #[test]
    fn failed_deletion_evicts_next_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let locked = write_segment(root, "rear", "rear_2024-01-01_00-00-00-000.mjpeg", 40, 300);
        let middle = write_segment(root, "front", "front_2024-01-01_00-01-00-000.mjpeg", 40, 200);
        let newest = write_segment(root, "rear", "rear_2024-01-01_00-02-00-000.mjpeg", 40, 100);

        let manager = StorageManager::new(settings(root, 100));
        let report = manager.enforce_with(|path| {
            if path == locked {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy"))
            } else {
                std::fs::remove_file(path)
            }
        });

        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, vec![middle.clone()]);
        assert_eq!(report.remaining_bytes, 80);
        assert!(locked.exists());
        assert!(!middle.exists());
        assert!(newest.exists());
        assert_eq!(manager.usage().used_bytes, 80);
    }

    #[test]
    fn vanished_files_count_as_freed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let oldest = write_segment(root, "front", "front_2024-01-01_00-00-00-000.mjpeg", 60, 300);
        let newest = write_segment(root, "front", "front_2024-01-01_00-01-00-000.mjpeg", 60, 100);

        let manager = StorageManager::new(settings(root, 100));
        let report = manager.enforce_with(|path| {
            std::fs::remove_file(path)?;
            // Second attempt on the same path reports NotFound
            std::fs::remove_file(path)
        });

        assert_eq!(report.failed, 0);
        assert_eq!(report.deleted, vec![oldest.clone()]);
        assert_eq!(report.remaining_bytes, 60);
        assert!(newest.exists());
    }

    #[test]
    fn enforce_ignores_hidden_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let workspace = write_segment(root, ".temp_export_1", "segment_000.mjpeg", 500, 900);
        let kept = write_segment(root, "front", "front_2024-01-01_00-00-00-000.mjpeg", 50, 10);

        let manager = StorageManager::new(settings(root, 100));
        let report = manager.enforce_cap();
        assert!(report.deleted.is_empty());
        assert!(workspace.exists());
        assert!(kept.exists());
    }

    #[test]
    fn usage_is_cached_until_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_segment(root, "front", "front_2024-01-01_00-00-00-000.mjpeg", 30, 10);

        let manager = StorageManager::new(settings(root, 60));
        let stats = manager.usage();
        assert_eq!(stats.used_bytes, 30);
        assert_eq!(stats.percent, 50.0);

        write_segment(root, "front", "front_2024-01-01_00-01-00-000.mjpeg", 60, 5);
        assert_eq!(manager.usage().used_bytes, 30);

        manager.enforce_cap();
        assert_eq!(manager.usage().used_bytes, 60);
    }

    #[test]
    fn disk_figures_are_cached_with_usage() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(settings(dir.path(), 100));
        *manager.disk_cache.lock() = Some((Instant::now(), Some((1_000, 250))));

        let stats = manager.usage();
        assert_eq!(stats.disk_total_bytes, Some(1_000));
        assert_eq!(stats.disk_available_bytes, Some(250));

        let uncached = StorageManager::new(StorageSettings {
            usage_cache: Duration::ZERO,
            ..settings(dir.path(), 100)
        });
        *uncached.disk_cache.lock() = Some((Instant::now(), Some((1_000, 250))));
        assert_ne!(uncached.usage().disk_total_bytes, Some(1_000));
    }

    #[test]
    fn temp_export_dirs_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".temp_export_20240101_abcd1234")).unwrap();
        std::fs::write(root.join(".temp_export_20240101_abcd1234/concat.txt"), b"x").unwrap();
        std::fs::create_dir_all(root.join(".temp_export_other")).unwrap();
        std::fs::create_dir_all(root.join(".export")).unwrap();
        std::fs::create_dir_all(root.join("front")).unwrap();

        let manager = StorageManager::new(settings(root, 100));
        assert_eq!(manager.cleanup_temp_export_dirs(), 2);
        assert!(root.join(".export").exists());
        assert!(root.join("front").exists());
        assert_eq!(manager.cleanup_temp_export_dirs(), 0);
    }

    #[test]
    fn enforcer_thread_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old = write_segment(root, "front", "front_2024-01-01_00-00-00-000.mjpeg", 80, 100);
        write_segment(root, "front", "front_2024-01-01_00-01-00-000.mjpeg", 80, 50);

        let manager = Arc::new(StorageManager::new(settings(root, 100)));
        manager.spawn_enforcer().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while old.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        manager.stop();
        assert!(!old.exists());
    }
}
