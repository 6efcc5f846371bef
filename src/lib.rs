// Dashcam - continuous multi-camera recorder
// Main library entry point

pub mod config;
pub mod encoding;
pub mod export;
pub mod recording;
pub mod storage;
pub mod video;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use config::Config;
use export::{ExportManager, ExportSettings};
use recording::{CameraManager, CameraSettings};
use storage::{ArchiveEntry, StorageManager, StorageSettings};

/// Running recorder: the handles an HTTP layer would serve from
pub struct Dashcam {
    config: Config,
    cameras: Arc<CameraManager>,
    storage: Arc<StorageManager>,
    export: Arc<ExportManager>,
}

impl Dashcam {
    /// Build every component from `config`, clean up after a previous run and
    /// start the quota enforcer. Cameras are not started.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        std::fs::create_dir_all(&config.video_dir)
            .with_context(|| format!("failed to create {}", config.video_dir.display()))?;

        let storage = Arc::new(StorageManager::new(StorageSettings::from_config(&config)));
        let swept = storage.cleanup_temp_export_dirs();
        if swept > 0 {
            log::info!("[Dashcam] Removed {} stale export workspace(s)", swept);
        }

        let export = Arc::new(ExportManager::new(ExportSettings::from_config(&config)));
        let recovered = export.recover();
        log::info!("[Dashcam] Export recovery: {:?}", recovered);

        storage.spawn_enforcer().context("failed to start quota enforcer")?;

        let cameras = match CameraManager::new(&config.cameras, CameraSettings::from_config(&config)) {
            Ok(cameras) => Arc::new(cameras),
            Err(e) => {
                storage.stop();
                return Err(e).context("failed to set up cameras");
            }
        };

        Ok(Self {
            config,
            cameras,
            storage,
            export,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cameras(&self) -> &Arc<CameraManager> {
        &self.cameras
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn export(&self) -> &Arc<ExportManager> {
        &self.export
    }

    /// Archive listing with estimated durations, newest first
    pub fn list_archive(&self) -> Vec<ArchiveEntry> {
        storage::list_archive(&self.config.video_dir, &self.config.cameras)
    }

    /// Stop cameras, abandon any export, then stop the quota enforcer
    pub fn shutdown(&self) {
        self.cameras.stop();
        self.export.shutdown();
        self.storage.stop();
    }
}

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Load the config at `path`, falling back to defaults
///
/// A missing file is created with the defaults. An unreadable one is left
/// alone for the user to fix.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        let config = Config::default();
        match config.save(path) {
            Ok(()) => log::info!("[Dashcam] Wrote default config to {}", path.display()),
            Err(e) => log::warn!("[Dashcam] Could not write default config: {}", e),
        }
        return config;
    }
    Config::load_or_default(path)
}

/// Run the recorder until Ctrl-C or until the cameras stop on their own
pub fn run(config_path: &Path) -> anyhow::Result<()> {
    init_logging();

    let config = load_config(config_path);
    log::info!("[Dashcam] Archive at {}", config.video_dir.display());

    let dashcam = Dashcam::new(config)?;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let cameras = Arc::clone(dashcam.cameras());
    let capture = std::thread::Builder::new()
        .name("dashcam-cameras".into())
        .spawn(move || {
            let _ = done_tx.send(cameras.start());
        })
        .context("failed to start camera thread")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let capture_result = runtime.block_on(async {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => log::info!("[Dashcam] Interrupt received, shutting down"),
                    Err(e) => log::error!("[Dashcam] Failed to listen for Ctrl-C: {}", e),
                }
                Ok(())
            }
            result = done_rx => match result {
                Ok(Ok(())) => {
                    log::warn!("[Dashcam] Cameras stopped unexpectedly");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(()),
            },
        }
    });

    dashcam.shutdown();
    if capture.join().is_err() {
        log::error!("[Dashcam] Camera thread panicked");
    }
    log::info!("[Dashcam] Stopped");

    capture_result.context("camera capture failed")
}
