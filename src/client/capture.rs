//! # Audio Capture Pipeline
//!
//! While a session is live, captures microphone audio in fixed-duration
//! chunks (100 ms by default), wraps each chunk as an `Audio` frame and hands
//! it to the transport channel. The pipeline never blocks the caller: the
//! timer-driven chunk loop runs on its own task and suspends between ticks.
//!
//! ## Device Ownership:
//! The microphone device is exclusively owned by this pipeline for the
//! duration of one capture run. `stop()` releases the device synchronously
//! before returning, so a subsequent `start()` on a new session can never
//! collide with a lingering open device handle.
//!
//! ## Gating:
//! `start()` is rejected with [`CaptureError::NotReady`] unless the session
//! is `Live` with the handshake received. Audio is never queued to send
//! later. Start and stop are both idempotent.

use crate::protocol::{encode, FrameKind};
use crate::session::Session;
use futures_util::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, warn};

/// Errors surfaced to the caller of `start()` / by the capture device.
#[derive(Debug)]
pub enum CaptureError {
    /// The session is not live with the handshake received. The session
    /// state is left unchanged and no frame reaches the wire.
    NotReady,
    /// The device is held by another capture session.
    DeviceBusy(String),
    /// The device failed (unplugged, permission revoked, ...).
    Device(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NotReady => write!(f, "session not ready for capture"),
            CaptureError::DeviceBusy(msg) => write!(f, "capture device busy: {}", msg),
            CaptureError::Device(msg) => write!(f, "capture device error: {}", msg),
        }
    }
}

/// An audio capture device with a chunked-read model.
///
/// This abstracts the platform capture API (the browser equivalent is a
/// `MediaRecorder` with a timeslice): `open()` acquires the microphone,
/// `read_chunk()` drains whatever codec-encoded audio accumulated since the
/// last read, `close()` releases the device.
///
/// `close()` must be idempotent; it is called both by the worker on its way
/// out and by `stop()`.
pub trait CaptureDevice: Send {
    /// Acquire the microphone. Errors surface to the caller of `start()`.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Drain the audio captured since the last read, already encoded in the
    /// negotiated codec. An empty chunk means "nothing yet" and is skipped.
    fn read_chunk(&mut self) -> Result<Vec<u8>, CaptureError>;

    /// Release the microphone. Must not block and must be idempotent.
    fn close(&mut self);
}

/// Timer-driven capture loop feeding `Audio` frames into the transport.
pub struct CapturePipeline {
    device: Arc<Mutex<Box<dyn CaptureDevice>>>,
    chunk_interval: Duration,
    transport: mpsc::Sender<Vec<u8>>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Create a pipeline around one capture device. `transport` receives
    /// fully encoded `Audio` frames ready for the socket.
    pub fn new(
        device: Box<dyn CaptureDevice>,
        chunk_interval: Duration,
        transport: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            chunk_interval,
            transport,
            worker: None,
        }
    }

    /// Whether the chunk loop is currently running.
    pub fn is_capturing(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Start capturing, gated on the session being live.
    ///
    /// Idempotent: starting while already capturing is a safe no-op. Device
    /// acquisition errors are returned to the caller; the session itself is
    /// unaffected by them (playback keeps running).
    pub fn start(&mut self, session: &Session) -> Result<(), CaptureError> {
        if self.is_capturing() {
            debug!("capture already running, start is a no-op");
            return Ok(());
        }

        if !session.may_stream() {
            debug!(
                state = session.state().as_str(),
                handshake = session.handshake_received(),
                "rejecting capture start: session not live"
            );
            return Err(CaptureError::NotReady);
        }

        // Acquire the device before spawning so resource errors surface
        // to the caller rather than dying inside the worker.
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .open()?;

        let device = Arc::clone(&self.device);
        let transport = self.transport.clone();
        let mut ticks = IntervalStream::new(tokio::time::interval(self.chunk_interval));

        self.worker = Some(tokio::spawn(async move {
            while ticks.next().await.is_some() {
                let chunk = device
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .read_chunk();

                match chunk {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        let frame = encode(FrameKind::Audio, &chunk);
                        // Chunk ownership ends here; nothing is retained.
                        if transport.send(frame).await.is_err() {
                            debug!("transport closed, stopping capture loop");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "capture device failed, stopping capture loop");
                        break;
                    }
                }
            }
            device
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .close();
        }));

        debug!(interval = ?self.chunk_interval, "capture started");
        Ok(())
    }

    /// Stop capturing and release the device before returning.
    ///
    /// Idempotent: stopping while not capturing is a safe no-op. The device
    /// lock serializes against an in-flight `read_chunk`, so once `close()`
    /// returns the device handle is truly free.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.device
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .close();
            worker.abort();
            debug!("capture stopped, device released");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Decoded};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeMicState {
        open: AtomicBool,
        reads: AtomicU32,
        busy: AtomicBool,
    }

    struct FakeMic {
        state: Arc<FakeMicState>,
    }

    impl CaptureDevice for FakeMic {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.state.busy.load(Ordering::SeqCst) {
                return Err(CaptureError::DeviceBusy("held elsewhere".into()));
            }
            self.state.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read_chunk(&mut self) -> Result<Vec<u8>, CaptureError> {
            let n = self.state.reads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![n as u8; 4])
        }

        fn close(&mut self) {
            self.state.open.store(false, Ordering::SeqCst);
        }
    }

    fn fake_mic() -> (Box<dyn CaptureDevice>, Arc<FakeMicState>) {
        let state = Arc::new(FakeMicState::default());
        (Box::new(FakeMic { state: state.clone() }), state)
    }

    fn live_session() -> Session {
        let mut session = Session::new(Duration::from_secs(4));
        session.on_socket_open();
        session.on_ready_frame();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_arrive_as_audio_frames() {
        let (mic, _state) = fake_mic();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(mic, Duration::from_millis(100), tx);

        pipeline.start(&live_session()).unwrap();

        for _ in 0..3 {
            let frame = rx.recv().await.expect("frame");
            match decode(&frame) {
                Decoded::Frame { kind, payload } => {
                    assert_eq!(kind, FrameKind::Audio);
                    assert_eq!(payload.len(), 4);
                }
                Decoded::Empty => panic!("empty frame on the wire"),
            }
        }
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_start_rejected_when_not_live() {
        let (mic, state) = fake_mic();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(mic, Duration::from_millis(100), tx);

        let mut session = Session::new(Duration::from_secs(4));
        assert!(matches!(pipeline.start(&session), Err(CaptureError::NotReady)));

        session.on_socket_open();
        assert!(matches!(pipeline.start(&session), Err(CaptureError::NotReady)));

        // No frame was produced and the device was never opened.
        assert!(!pipeline.is_capturing());
        assert!(!state.open.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_device_and_is_idempotent() {
        let (mic, state) = fake_mic();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(mic, Duration::from_millis(100), tx);

        pipeline.start(&live_session()).unwrap();
        let _ = rx.recv().await;
        assert!(state.open.load(Ordering::SeqCst));

        pipeline.stop();
        assert!(!state.open.load(Ordering::SeqCst));
        assert!(!pipeline.is_capturing());

        // Stopping again is a safe no-op.
        pipeline.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (mic, _state) = fake_mic();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(mic, Duration::from_millis(100), tx);

        let session = live_session();
        pipeline.start(&session).unwrap();
        pipeline.start(&session).unwrap();
        assert!(pipeline.is_capturing());

        let _ = rx.recv().await;
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_busy_device_error_surfaces() {
        let (mic, state) = fake_mic();
        state.busy.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(mic, Duration::from_millis(100), tx);

        assert!(matches!(
            pipeline.start(&live_session()),
            Err(CaptureError::DeviceBusy(_))
        ));
        assert!(!pipeline.is_capturing());
    }
}
