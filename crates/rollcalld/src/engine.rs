use crate::service::Attendance;
use rollcall_core::detector::DetectorError;
use rollcall_core::{
    CosineMatcher, DetectionState, Embedding, ExtractError, FaceBox, FaceDetector,
    FeatureExtractor, Recognizer,
};
use rollcall_hw::{Camera, Frame, FrameError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("face region unusable: {0}")]
    Extract(#[from] ExtractError),
    #[error("no frame captured yet")]
    NoFrame,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces in view; exactly one person must face the camera")]
    MultipleFaces(usize),
    #[error("camera is not running")]
    NotRunning,
    #[error("engine thread failed: {0}")]
    Thread(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Settings fixed for the lifetime of one engine thread.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub camera_device: String,
    pub detector_model: String,
    pub warmup_frames: usize,
    pub tick_interval: Duration,
    pub threshold: f32,
}

/// Result of an enrollment capture.
pub struct Capture {
    pub embedding: Embedding,
    pub confidence: f32,
    /// Where the snapshot landed, if it could be written.
    pub image_path: Option<PathBuf>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Capture {
        snapshot: Option<PathBuf>,
        reply: oneshot::Sender<Result<Capture, EngineError>>,
    },
}

/// Handle to a running engine thread. Dropping it also stops the loop.
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    cancel: watch::Sender<bool>,
    thread: std::thread::JoinHandle<()>,
}

impl EngineHandle {
    /// Take the face in the next frame as an enrollment sample.
    pub async fn capture(&self, snapshot: Option<PathBuf>) -> Result<Capture, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture {
                snapshot,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the loop and wait until the thread has released the camera.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.cancel.send(true);
        drop(self.tx);
        let thread = self.thread;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| EngineError::Thread(e.to_string()))?
            .map_err(|_| EngineError::Thread("engine thread panicked".into()))
    }
}

/// Spawn the detection loop on a dedicated OS thread.
///
/// Opens the camera, loads the detector and discards warmup frames before
/// returning, so a missing device or model fails here rather than in the
/// loop.
pub fn spawn_engine(
    settings: EngineSettings,
    service: Arc<Attendance>,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&settings.camera_device)?;
    tracing::info!(
        device = %settings.camera_device,
        width = camera.width,
        height = camera.height,
        "camera opened"
    );

    let detector = FaceDetector::load(&settings.detector_model)?;
    tracing::info!(path = %settings.detector_model, "SCRFD detector loaded");

    if settings.warmup_frames > 0 {
        tracing::info!(count = settings.warmup_frames, "discarding warmup frames");
        camera.warm_up(settings.warmup_frames);
    }

    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let engine = Engine {
        camera,
        detector,
        recognizer: Recognizer::new(CosineMatcher, settings.threshold),
        tick_interval: settings.tick_interval,
        service,
    };

    let thread = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || engine.run(rx, cancel_rx))
        .map_err(|e| EngineError::Thread(e.to_string()))?;

    Ok(EngineHandle {
        tx,
        cancel: cancel_tx,
        thread,
    })
}

struct Engine {
    camera: Camera,
    detector: FaceDetector,
    recognizer: Recognizer<CosineMatcher>,
    tick_interval: Duration,
    service: Arc<Attendance>,
}

impl Engine {
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>, cancel: watch::Receiver<bool>) {
        tracing::info!(interval_ms = self.tick_interval.as_millis() as u64, "engine thread started");
        let mut ticks: u64 = 0;

        loop {
            if *cancel.borrow() {
                break;
            }
            let started = Instant::now();

            let current = self.tick();
            ticks += 1;

            if !self.drain_requests(&mut rx, current.as_ref()) {
                break;
            }

            let remaining = self.tick_interval.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }

        self.recognizer.reset();
        tracing::info!(ticks, "engine thread exiting");
    }

    /// Capture, detect and recognize one frame.
    fn tick(&mut self) -> Option<(Frame, Vec<FaceBox>)> {
        let frame = match self.camera.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return None;
            }
        };

        let faces = if frame.is_dark() {
            tracing::trace!(sequence = frame.sequence, "dark frame");
            Vec::new()
        } else {
            match self.detector.detect(&frame.data, frame.width, frame.height) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed");
                    Vec::new()
                }
            }
        };

        let outcome = self.service.observe_frame(&mut self.recognizer, &frame, &faces);
        tracing::trace!(
            sequence = frame.sequence,
            faces = outcome.face_count,
            state = ?outcome.state,
            "tick"
        );
        Some((frame, faces))
    }

    /// Answer pending requests against this tick's frame. Returns false once
    /// every handle is gone.
    fn drain_requests(
        &self,
        rx: &mut mpsc::Receiver<EngineRequest>,
        current: Option<&(Frame, Vec<FaceBox>)>,
    ) -> bool {
        loop {
            match rx.try_recv() {
                Ok(EngineRequest::Capture { snapshot, reply }) => {
                    let result = match current {
                        Some((frame, faces)) => capture_enrollment(frame, faces, snapshot),
                        None => Err(EngineError::NoFrame),
                    };
                    let _ = reply.send(result);
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}

/// Extract an enrollment embedding from a frame holding exactly one face,
/// and write the frame to `snapshot` if given.
fn capture_enrollment(
    frame: &Frame,
    faces: &[FaceBox],
    snapshot: Option<PathBuf>,
) -> Result<Capture, EngineError> {
    let face = match (DetectionState::from_face_count(faces.len()), faces.first()) {
        (DetectionState::Single, Some(face)) => face,
        (DetectionState::Crowded, _) => return Err(EngineError::MultipleFaces(faces.len())),
        _ => return Err(EngineError::NoFaceDetected),
    };

    let embedding = FeatureExtractor.extract(frame, face)?;
    tracing::info!(confidence = face.confidence, "enroll: face captured");

    let image_path = snapshot.and_then(|path| match save_snapshot(frame, &path) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot not saved");
            None
        }
    });

    Ok(Capture {
        embedding,
        confidence: face.confidence,
        image_path,
    })
}

fn save_snapshot(frame: &Frame, path: &std::path::Path) -> Result<(), FrameError> {
    frame.save(path)?;
    tracing::debug!(path = %path.display(), "snapshot saved");
    Ok(())
}

/// Owns the engine thread across Start/Stop cycles.
pub struct EngineControl {
    settings: EngineSettings,
    service: Arc<Attendance>,
    handle: tokio::sync::Mutex<Option<EngineHandle>>,
}

impl EngineControl {
    pub fn new(settings: EngineSettings, service: Arc<Attendance>) -> Self {
        Self {
            settings,
            service,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the camera loop and a fresh session. Returns false if it was
    /// already running.
    pub async fn start(&self) -> Result<bool, EngineError> {
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            return Ok(false);
        }

        let settings = self.settings.clone();
        let service = Arc::clone(&self.service);
        let handle = tokio::task::spawn_blocking(move || spawn_engine(settings, service))
            .await
            .map_err(|e| EngineError::Thread(e.to_string()))??;

        self.service.start_session();
        *slot = Some(handle);
        Ok(true)
    }

    /// Stop the loop and end the session. Returns false if it was not
    /// running.
    ///
    /// Returns only after the engine thread has exited, so the camera is free
    /// for the next `start` and no late tick can touch the session.
    pub async fn stop(&self) -> bool {
        let mut slot = self.handle.lock().await;
        let Some(handle) = slot.take() else {
            return false;
        };
        if let Err(e) = handle.shutdown().await {
            tracing::warn!(error = %e, "engine did not shut down cleanly");
        }
        self.service.stop_session();
        true
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    pub async fn capture(&self, snapshot: Option<PathBuf>) -> Result<Capture, EngineError> {
        let slot = self.handle.lock().await;
        let handle = slot.as_ref().ok_or(EngineError::NotRunning)?;
        handle.capture(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [(x % 256) as u8, (y % 256) as u8, 90]
            })
            .collect();
        Frame {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence: 1,
        }
    }

    #[test]
    fn test_capture_requires_single_face() {
        let f = frame(160, 120);
        let a = FaceBox::new((10.0, 10.0), (70.0, 90.0));
        let b = FaceBox::new((80.0, 10.0), (150.0, 90.0));

        assert!(matches!(
            capture_enrollment(&f, &[], None),
            Err(EngineError::NoFaceDetected)
        ));
        assert!(matches!(
            capture_enrollment(&f, &[a, b], None),
            Err(EngineError::MultipleFaces(2))
        ));

        let capture = capture_enrollment(&f, &[a], None).unwrap();
        assert!(capture.image_path.is_none());
        assert_eq!(capture.embedding, FeatureExtractor.extract(&f, &a).unwrap());
    }

    #[test]
    fn test_capture_rejects_degenerate_box() {
        let f = frame(64, 64);
        let flat = FaceBox::new((10.0, 10.0), (10.0, 40.0));
        assert!(matches!(
            capture_enrollment(&f, &[flat], None),
            Err(EngineError::Extract(_))
        ));
    }

    #[tokio::test]
    async fn test_control_reports_not_running() {
        let service = Arc::new(Attendance::new(None));
        let control = EngineControl::new(
            EngineSettings {
                camera_device: "/dev/rollcall-missing".into(),
                detector_model: "/nonexistent/det_10g.onnx".into(),
                warmup_frames: 0,
                tick_interval: Duration::from_millis(100),
                threshold: 0.85,
            },
            service,
        );

        assert!(!control.is_running().await);
        assert!(!control.stop().await);
        assert!(matches!(
            control.capture(None).await,
            Err(EngineError::NotRunning)
        ));
        assert!(matches!(control.start().await, Err(EngineError::Camera(_))));
        assert!(!control.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_waits_for_engine_thread() {
        let service = Arc::new(Attendance::new(None));
        service.start_session();
        let control = EngineControl::new(
            EngineSettings {
                camera_device: "/dev/rollcall-missing".into(),
                detector_model: "/nonexistent/det_10g.onnx".into(),
                warmup_frames: 0,
                tick_interval: Duration::from_millis(10),
                threshold: 0.85,
            },
            Arc::clone(&service),
        );

        // Stand-in loop that finishes one last, slow tick after cancellation.
        let (tx, _rx) = mpsc::channel::<EngineRequest>(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let late = Arc::clone(&service);
        let thread = std::thread::spawn(move || {
            while !*cancel_rx.borrow() {
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(50));
            let f = frame(160, 120);
            let faces = [
                FaceBox::new((10.0, 10.0), (70.0, 90.0)),
                FaceBox::new((80.0, 10.0), (150.0, 90.0)),
            ];
            let mut recognizer = Recognizer::new(CosineMatcher, 0.85);
            late.observe_frame(&mut recognizer, &f, &faces);
        });
        *control.handle.lock().await = Some(EngineHandle {
            tx,
            cancel: cancel_tx,
            thread,
        });

        assert!(control.is_running().await);
        assert!(control.stop().await);
        assert!(!control.is_running().await);

        let snapshot = service.snapshot();
        assert!(!snapshot.session_active);
        assert_eq!(snapshot.detection, DetectionState::Empty);
        assert_eq!(snapshot.face_count, 0);
    }
}
