// Live frame cache and MJPEG streaming
//
// One StreamManager per camera. The frame-refresh thread writes the newest
// complete JPEG here; HTTP handlers read it either once (a snapshot) or
// repeatedly as a multipart/x-mixed-replace stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::LiveConfig;

/// Multipart boundary used between stream parts
pub const BOUNDARY: &str = "frame";

/// Headers that stop browsers and proxies from caching live frames
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

// Parts between debug log lines of a running stream
const STREAM_LOG_INTERVAL: u64 = 100;

/// Error type for stream operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Too many viewers for camera {camera_id} (limit {limit})")]
    TooManyViewers { camera_id: String, limit: usize },

    #[error("Camera not found: {0}")]
    CameraNotFound(String),
}

/// Streaming parameters shared by all viewers of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub interval: Duration,
    pub max_missed_frames: u32,
    pub max_viewers: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&LiveConfig::default())
    }
}

impl From<&LiveConfig> for StreamSettings {
    fn from(live: &LiveConfig) -> Self {
        Self {
            interval: live.stream_interval(),
            max_missed_frames: live.max_missed_frames,
            max_viewers: live.max_viewers,
        }
    }
}

/// Result of a single-shot frame request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleFrame {
    Frame(Vec<u8>),
    /// No frame captured yet; the client should retry shortly
    Unavailable,
}

impl SingleFrame {
    /// HTTP status code for the response
    pub fn status(&self) -> u16 {
        match self {
            SingleFrame::Frame(_) => 200,
            SingleFrame::Unavailable => 503,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SingleFrame::Frame(_) => "image/jpeg",
            SingleFrame::Unavailable => "text/plain; charset=utf-8",
        }
    }

    /// Response body
    pub fn body(&self) -> &[u8] {
        match self {
            SingleFrame::Frame(data) => data.as_slice(),
            SingleFrame::Unavailable => {
                &b"Recording is initializing - no frames available yet. Please try again in a few seconds."[..]
            }
        }
    }
}

/// Why a continuous stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The viewer went away or a write failed
    Disconnected,
    /// No frame appeared for too many consecutive intervals
    NoFrames,
    /// The camera was stopped
    Closed,
}

/// Latest frame of one camera
pub struct StreamManager {
    camera_id: String,
    frame: RwLock<Option<Vec<u8>>>,
    closed: AtomicBool,
    viewers: AtomicUsize,
    settings: StreamSettings,
}

impl StreamManager {
    pub fn new(camera_id: impl Into<String>, settings: StreamSettings) -> Self {
        Self {
            camera_id: camera_id.into(),
            frame: RwLock::new(None),
            closed: AtomicBool::new(false),
            viewers: AtomicUsize::new(0),
            settings,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Replace the cached frame with a copy of `data`
    pub fn update(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let copy = data.to_vec();
        *self.frame.write() = Some(copy);
    }

    /// Copy of the cached frame
    pub fn latest(&self) -> Option<Vec<u8>> {
        self.frame.read().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.frame.read().is_some()
    }

    pub fn serve_once(&self) -> SingleFrame {
        match self.latest() {
            Some(data) => SingleFrame::Frame(data),
            None => {
                log::warn!("[Stream] No frames available for camera {} yet", self.camera_id);
                SingleFrame::Unavailable
            }
        }
    }

    /// Mark the camera stopped; running streams end at their next interval
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of continuous viewers currently attached
    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Content-Type header value for `serve_continuous` responses
    pub fn multipart_content_type() -> String {
        format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
    }

    /// Stream multipart JPEG parts to `writer` until the viewer leaves,
    /// frames stop arriving, or the camera closes.
    ///
    /// `shutdown` resolves when the client disconnects.
    pub async fn serve_continuous<W, F>(&self, writer: &mut W, shutdown: F) -> Result<StreamEnd, StreamError>
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let _slot = self.acquire_viewer()?;
        log::info!("[Stream] Viewer connected to camera {}", self.camera_id);

        let end = self.stream_loop(writer, shutdown).await;

        log::info!("[Stream] Viewer left camera {} ({:?})", self.camera_id, end);
        Ok(end)
    }

    async fn stream_loop<W, F>(&self, writer: &mut W, shutdown: F) -> StreamEnd
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sent: u64 = 0;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => return StreamEnd::Disconnected,
                _ = ticker.tick() => {}
            }

            if self.is_closed() {
                return StreamEnd::Closed;
            }

            let Some(frame) = self.latest() else {
                missed += 1;
                if missed > self.settings.max_missed_frames {
                    log::warn!("[Stream] No frames from camera {}, closing stream", self.camera_id);
                    return StreamEnd::NoFrames;
                }
                continue;
            };
            missed = 0;

            if let Err(e) = write_part(writer, &frame).await {
                log::debug!("[Stream] Write to viewer failed: {}", e);
                return StreamEnd::Disconnected;
            }

            sent += 1;
            if sent % STREAM_LOG_INTERVAL == 0 {
                log::debug!("[Stream] Sent {} frames for camera {}", sent, self.camera_id);
            }
        }
    }

    fn acquire_viewer(&self) -> Result<ViewerSlot<'_>, StreamError> {
        let limit = self.settings.max_viewers;
        self.viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .map_err(|_| StreamError::TooManyViewers {
                camera_id: self.camera_id.clone(),
                limit,
            })?;
        Ok(ViewerSlot { viewers: &self.viewers })
    }
}

/// Holds one of the camera's viewer slots until dropped
struct ViewerSlot<'a> {
    viewers: &'a AtomicUsize,
}

impl Drop for ViewerSlot<'_> {
    fn drop(&mut self) {
        self.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn write_part<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(frame).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_settings(max_viewers: usize) -> StreamSettings {
        StreamSettings {
            interval: Duration::from_millis(5),
            max_missed_frames: 3,
            max_viewers,
        }
    }

    #[test]
    fn empty_cache_is_retryable_unavailable() {
        let stream = StreamManager::new("front", StreamSettings::default());
        let frame = stream.serve_once();
        assert_eq!(frame, SingleFrame::Unavailable);
        assert_eq!(frame.status(), 503);
    }

    #[test]
    fn update_copies_and_ignores_empty() {
        let stream = StreamManager::new("front", StreamSettings::default());
        let mut data = vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9];
        stream.update(&data);
        data[2] = 0x99;
        stream.update(&[]);

        let frame = stream.serve_once();
        assert_eq!(frame.status(), 200);
        assert_eq!(frame.body(), &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn stream_ends_after_missed_frames() {
        let stream = StreamManager::new("front", fast_settings(1));
        let mut out = Vec::new();
        let end = stream
            .serve_continuous(&mut out, std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::NoFrames);
        assert!(out.is_empty());
        assert_eq!(stream.viewer_count(), 0);
    }

    #[tokio::test]
    async fn stream_writes_multipart_parts_until_disconnect() {
        let stream = StreamManager::new("front", fast_settings(1));
        stream.update(&[0xFF, 0xD8, 0xAB, 0xFF, 0xD9]);

        let mut out = Vec::new();
        let end = stream
            .serve_continuous(&mut out, tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Disconnected);

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n"));
        assert!(out.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn closing_ends_running_streams() {
        let stream = Arc::new(StreamManager::new("front", fast_settings(2)));
        stream.update(&[0xFF, 0xD8, 0xFF, 0xD9]);

        let viewer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                stream.serve_continuous(&mut sink, std::future::pending::<()>()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close();
        assert_eq!(viewer.await.unwrap().unwrap(), StreamEnd::Closed);
    }

    #[tokio::test]
    async fn viewers_beyond_limit_are_refused() {
        let stream = Arc::new(StreamManager::new("front", fast_settings(1)));
        stream.update(&[0xFF, 0xD8, 0xFF, 0xD9]);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                stream
                    .serve_continuous(&mut sink, async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        while stream.viewer_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut out = Vec::new();
        let second = stream.serve_continuous(&mut out, std::future::ready(())).await;
        assert!(matches!(second, Err(StreamError::TooManyViewers { limit: 1, .. })));
        assert!(out.is_empty());

        tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), StreamEnd::Disconnected);
        assert_eq!(stream.viewer_count(), 0);
    }
}
