//! Frame sources and the grabber thread that feeds the tracking worker.
//!
//! Camera hardware lives outside this crate; it only has to implement
//! [`FrameSource`]. The [`FrameGrabber`] runs a source on its own thread and
//! pushes frames into a bounded channel, dropping frames instead of blocking
//! when the tracking side falls behind.

use super::synthetic::SyntheticScene;
use super::{CaptureConfig, Frame};
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    #[error("failed to configure camera: {0}")]
    ConfigFailed(String),
    #[error("failed to capture frame: {0}")]
    CaptureFailed(String),
    #[error("camera not initialized")]
    NotInitialized,
}

/// Anything that yields timestamped frames.
pub trait FrameSource: Send {
    /// Opens and initializes the source with the given configuration.
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CameraError>;

    /// Captures a single frame.
    ///
    /// `Ok(None)` means no frame was ready yet; callers poll again.
    fn capture(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Checks if the source is currently open.
    fn is_open(&self) -> bool;

    /// Closes the source and releases resources.
    fn close(&mut self);
}

/// Camera that renders a synthetic larva.
///
/// Timestamps come from the frame counter and configured rate, so a
/// sequence of captures is fully deterministic. A [`FrameGrabber`]
/// replaces them with the experiment clock.
#[derive(Debug, Default)]
pub struct SyntheticCamera {
    config: Option<CaptureConfig>,
    scene: Option<SyntheticScene>,
    sequence: u64,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSource for SyntheticCamera {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CameraError> {
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.scene = Some(SyntheticScene::new(
            config.scene.clone(),
            config.width as usize,
            config.height as usize,
        ));
        self.config = Some(config.clone());
        self.sequence = 0;
        tracing::info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Synthetic camera opened"
        );
        Ok(())
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        let config = self.config.as_ref().ok_or(CameraError::NotInitialized)?;
        let scene = self.scene.as_mut().ok_or(CameraError::NotInitialized)?;

        let timestamp = self.sequence as f64 / config.fps;
        let image = scene.render(timestamp);
        let frame = Frame::new(image, timestamp, self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn close(&mut self) {
        self.config = None;
        self.scene = None;
        tracing::info!("Synthetic camera closed");
    }
}

/// Runs a [`FrameSource`] on a dedicated thread.
pub struct FrameGrabber {
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

impl FrameGrabber {
    /// Opens `source` and starts pushing frames into `tx`.
    ///
    /// Every frame is stamped with the seconds since `epoch` at the moment
    /// it was captured, whatever clock the source itself uses. When `pace`
    /// is set, captures are spaced at the configured frame rate; otherwise
    /// the source is polled as fast as it produces frames. The thread exits
    /// when `stop` is raised or every receiver is gone.
    pub fn spawn<S: FrameSource + 'static>(
        mut source: S,
        config: &CaptureConfig,
        tx: Sender<Frame>,
        stop: Arc<AtomicBool>,
        pace: bool,
        epoch: Instant,
    ) -> Result<Self, CameraError> {
        source.open(config)?;
        let period = Duration::from_secs_f64(1.0 / config.fps);
        let dropped = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped_counter = Arc::clone(&dropped);
        let delivered_counter = Arc::clone(&delivered);

        let handle = std::thread::Builder::new()
            .name("frame-grabber".into())
            .spawn(move || {
                let mut next_due = Instant::now();
                while !stop.load(Ordering::Relaxed) {
                    if pace {
                        let now = Instant::now();
                        if now < next_due {
                            std::thread::sleep(next_due - now);
                        }
                        next_due += period;
                    }

                    let frame = match source.capture() {
                        Ok(Some(frame)) => frame.with_timestamp(epoch.elapsed().as_secs_f64()),
                        Ok(None) => {
                            std::thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Frame capture failed");
                            continue;
                        }
                    };

                    match tx.try_send(frame) {
                        Ok(()) => {
                            delivered_counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(frame)) => {
                            dropped_counter.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(sequence = frame.sequence(), "Frame queue full, dropping frame");
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                source.close();
            })
            .map_err(|e| CameraError::OpenFailed(e.to_string()))?;

        Ok(Self {
            handle: Some(handle),
            dropped,
            delivered,
        })
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames handed to the queue.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Waits for the grabber thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Frame grabber thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_synthetic_camera_lifecycle() {
        let mut camera = SyntheticCamera::new();
        let config = CaptureConfig::default();

        assert!(!camera.is_open());

        camera.open(&config).unwrap();
        assert!(camera.is_open());

        let frame = camera.capture().unwrap().unwrap();
        assert!(frame.is_valid());
        assert_eq!(frame.sequence(), 0);
        assert_eq!(frame.timestamp(), 0.0);

        let frame2 = camera.capture().unwrap().unwrap();
        assert_eq!(frame2.sequence(), 1);
        assert!(frame2.timestamp() > frame.timestamp());

        camera.close();
        assert!(!camera.is_open());
    }

    #[test]
    fn test_capture_without_open() {
        let mut camera = SyntheticCamera::new();
        assert!(matches!(camera.capture(), Err(CameraError::NotInitialized)));
    }

    #[test]
    fn test_grabber_drops_when_queue_full() {
        let (tx, rx) = bounded(2);
        let stop = Arc::new(AtomicBool::new(false));
        let config = CaptureConfig::with_dimensions(32, 32);
        let grabber =
            FrameGrabber::spawn(
                SyntheticCamera::new(),
                &config,
                tx,
                Arc::clone(&stop),
                false,
                Instant::now(),
            )
            .unwrap();

        while grabber.dropped() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        stop.store(true, Ordering::Relaxed);
        grabber.join();

        let received: Vec<Frame> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(received[0].sequence() < received[1].sequence());
    }

    #[test]
    fn test_unpaced_grabber_stamps_wall_clock() {
        let (tx, rx) = bounded(512);
        let stop = Arc::new(AtomicBool::new(false));
        let config = CaptureConfig::with_dimensions(32, 32);
        // the epoch predates the grabber, as it does in a session
        let epoch = Instant::now() - Duration::from_secs(5);
        let grabber =
            FrameGrabber::spawn(SyntheticCamera::new(), &config, tx, Arc::clone(&stop), false, epoch)
                .unwrap();

        let mut frames = Vec::new();
        while frames.len() < 300 {
            frames.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        let now = epoch.elapsed().as_secs_f64();
        stop.store(true, Ordering::Relaxed);
        grabber.join();

        let first = frames[0].timestamp();
        let last = frames[frames.len() - 1].timestamp();
        assert!(first >= 5.0);
        assert!(last <= now, "frame at {last} s is ahead of the clock at {now} s");
        assert!(frames.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
        assert!(frames.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
    }
}
