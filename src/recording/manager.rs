// Camera fleet supervision
//
// Owns one Camera per enabled camera config. Lookups go through an RwLock so
// a configuration change swaps the whole fleet at once: readers see either
// the old set or the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use super::camera::{Camera, CameraSettings, CaptureError, Result};
use super::stream::{StreamError, StreamManager};
use super::CameraStatus;
use crate::config::{CameraConfig, ConfigError};

struct CameraSlot {
    camera: Arc<Camera>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Fleet {
    /// Camera ids in configuration order
    order: Vec<String>,
    cameras: HashMap<String, CameraSlot>,
}

impl Fleet {
    fn build(configs: &[CameraConfig], settings: &CameraSettings) -> Result<Self> {
        let mut fleet = Fleet::default();
        for config in configs.iter().filter(|c| c.enabled) {
            if fleet.cameras.contains_key(&config.id) {
                return Err(ConfigError::DuplicateCamera(config.id.clone()).into());
            }
            let camera = Camera::new(config.clone(), settings.clone())?;
            fleet.order.push(config.id.clone());
            fleet.cameras.insert(
                config.id.clone(),
                CameraSlot {
                    camera: Arc::new(camera),
                    thread: Mutex::new(None),
                },
            );
        }

        if fleet.order.is_empty() {
            return Err(CaptureError::NoCameras);
        }
        Ok(fleet)
    }

    fn slots(&self) -> impl Iterator<Item = &CameraSlot> {
        self.order.iter().filter_map(|id| self.cameras.get(id))
    }

    fn spawn_all(&self) -> Result<()> {
        for slot in self.slots() {
            let mut thread = slot.thread.lock();
            if thread.is_some() {
                continue;
            }
            let camera = Arc::clone(&slot.camera);
            let handle = std::thread::Builder::new()
                .name(format!("dashcam-camera-{}", camera.id()))
                .spawn(move || {
                    if let Err(e) = camera.run() {
                        log::error!("[Camera] {} failed: {}", camera.id(), e);
                    }
                })
                .map_err(|e| CaptureError::Thread(e.to_string()))?;
            *thread = Some(handle);
        }
        Ok(())
    }

    /// Stop every camera, wait for its thread, and close its live cache
    fn shutdown(&self) {
        for slot in self.slots() {
            slot.camera.stop();
        }
        for slot in self.slots() {
            if let Some(handle) = slot.thread.lock().take() {
                if handle.join().is_err() {
                    log::error!("[Camera] Capture thread for {} panicked", slot.camera.id());
                }
            }
            slot.camera.stream().close();
        }
    }
}

pub struct CameraManager {
    settings: CameraSettings,
    fleet: RwLock<Fleet>,
    /// Serializes start, restart and stop
    lifecycle: Mutex<()>,
    started: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl CameraManager {
    /// Build cameras for every enabled config. Fails if none are enabled.
    pub fn new(configs: &[CameraConfig], settings: CameraSettings) -> Result<Self> {
        let fleet = Fleet::build(configs, &settings)?;
        let (stop_tx, stop_rx) = bounded(0);

        Ok(Self {
            settings,
            fleet: RwLock::new(fleet),
            lifecycle: Mutex::new(()),
            started: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        })
    }

    /// Run every camera until `stop`, then wait for all of them to exit.
    /// Blocks the calling thread.
    pub fn start(&self) -> Result<()> {
        {
            let _lifecycle = self.lifecycle.lock();
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let fleet = self.fleet.read();
            log::info!("[Camera] Starting {} camera(s)", fleet.order.len());
            if let Err(e) = fleet.spawn_all() {
                fleet.shutdown();
                return Err(e);
            }
        }

        // Returns once the sender is dropped by `stop`
        let _ = self.stop_rx.recv();

        let _lifecycle = self.lifecycle.lock();
        self.fleet.read().shutdown();
        log::info!("[Camera] All cameras stopped");
        Ok(())
    }

    /// Make `start` return after stopping every camera
    pub fn stop(&self) {
        if self.stop_tx.lock().take().is_some() {
            log::info!("[Camera] Stopping all cameras");
        }
        for slot in self.fleet.read().slots() {
            slot.camera.stop();
        }
    }

    /// Replace the fleet with one built from `configs`
    ///
    /// On a validation error the running fleet is left untouched.
    pub fn restart_with_configs(&self, configs: &[CameraConfig]) -> Result<()> {
        let new_fleet = Fleet::build(configs, &self.settings)?;

        let _lifecycle = self.lifecycle.lock();
        let old_fleet = std::mem::replace(&mut *self.fleet.write(), new_fleet);

        log::info!("[Camera] Restarting with {} camera(s)", configs.iter().filter(|c| c.enabled).count());
        old_fleet.shutdown();

        let stopping = self.stop_tx.lock().is_none();
        if self.started.load(Ordering::SeqCst) && !stopping {
            self.fleet.read().spawn_all()?;
        }
        Ok(())
    }

    /// Configs of the running cameras, in configuration order
    pub fn list_cameras(&self) -> Vec<CameraConfig> {
        self.fleet.read().slots().map(|s| s.camera.config().clone()).collect()
    }

    pub fn get_stream_manager(&self, camera_id: &str) -> Option<Arc<StreamManager>> {
        self.fleet.read().cameras.get(camera_id).map(|s| s.camera.stream())
    }

    /// Like `get_stream_manager`, for handlers that report a missing camera
    pub fn stream(&self, camera_id: &str) -> std::result::Result<Arc<StreamManager>, StreamError> {
        self.get_stream_manager(camera_id)
            .ok_or_else(|| StreamError::CameraNotFound(camera_id.to_string()))
    }

    /// First camera in configuration order
    pub fn default_camera_id(&self) -> Option<String> {
        self.fleet.read().order.first().cloned()
    }

    pub fn camera_status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.fleet.read().cameras.get(camera_id).map(|s| s.camera.status())
    }

    /// Status of every camera, in configuration order
    pub fn statuses(&self) -> Vec<CameraStatus> {
        self.fleet.read().slots().map(|s| s.camera.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EncoderTools, Tool};
    use std::time::Duration;

    fn settings(dir: &std::path::Path) -> CameraSettings {
        CameraSettings {
            video_dir: dir.to_path_buf(),
            tools: EncoderTools::new(Tool::new("/nonexistent/ffmpeg"), Tool::new("/nonexistent/rpicam-vid")),
            restart_backoff: Duration::from_millis(10),
            ..CameraSettings::default()
        }
    }

    fn camera(id: &str, enabled: bool) -> CameraConfig {
        let mut config = CameraConfig::new(id, "/dev/video0");
        config.enabled = enabled;
        config
    }

    #[test]
    fn no_enabled_cameras_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CameraManager::new(&[camera("front", false)], settings(dir.path()));
        assert!(matches!(result, Err(CaptureError::NoCameras)));
        assert!(matches!(CameraManager::new(&[], settings(dir.path())), Err(CaptureError::NoCameras)));
    }

    #[test]
    fn lookups_follow_configuration_order() {
        let dir = tempfile::tempdir().unwrap();
        let configs = [camera("rear", true), camera("cabin", false), camera("front", true)];
        let manager = CameraManager::new(&configs, settings(dir.path())).unwrap();

        let ids: Vec<_> = manager.list_cameras().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["rear", "front"]);
        assert_eq!(manager.default_camera_id().as_deref(), Some("rear"));
        assert!(manager.get_stream_manager("front").is_some());
        assert!(manager.get_stream_manager("cabin").is_none());
        assert!(manager.camera_status("missing").is_none());
        assert!(matches!(manager.stream("cabin"), Err(StreamError::CameraNotFound(id)) if id == "cabin"));
    }

    #[test]
    fn restart_rejects_bad_configs_and_keeps_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CameraManager::new(&[camera("front", true)], settings(dir.path())).unwrap();

        let err = manager.restart_with_configs(&[camera("a", true), camera("a", true)]);
        assert!(matches!(err, Err(CaptureError::Config(ConfigError::DuplicateCamera(_)))));
        assert_eq!(manager.default_camera_id().as_deref(), Some("front"));
    }

    #[test]
    fn start_restart_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CameraManager::new(&[camera("front", true)], settings(dir.path())).unwrap());

        let runner = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.start())
        };

        let old_stream = loop {
            if let Some(status) = manager.camera_status("front") {
                if status.failed_segments > 0 {
                    break manager.get_stream_manager("front").unwrap();
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        manager.restart_with_configs(&[camera("rear", true)]).unwrap();
        assert!(old_stream.is_closed());
        assert!(manager.get_stream_manager("front").is_none());
        assert_eq!(manager.default_camera_id().as_deref(), Some("rear"));

        manager.stop();
        runner.join().unwrap().unwrap();

        let rear = manager.get_stream_manager("rear").unwrap();
        assert!(rear.is_closed());
        assert!(dir.path().join("rear").is_dir());
    }
}
