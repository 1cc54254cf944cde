//! # Playback Scheduler
//!
//! Schedules decoded audio chunks on the playback device so consecutive
//! chunks play back-to-back with no audible gap and no overlap, despite
//! irregular (jittery) network arrival times.
//!
//! ## Scheduling Algorithm:
//! The scheduler owns `next_play_at`, a virtual clock cursor in the playback
//! device's own clock domain. For each arriving chunk of duration `d`:
//! 1. If `next_play_at` is earlier than "now", clamp it to "now" (catch-up
//!    after a stall)
//! 2. Schedule the chunk to start exactly at `next_play_at`
//! 3. Advance `next_play_at += d`
//!
//! As long as chunks arrive in order (WebSocket frames are ordered per
//! connection), playback is monotonic and gapless. The cursor is initialized
//! to "now" exactly once per session, when the backend readiness handshake is
//! processed, and only ever moves forward afterward.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors produced while decoding one audio chunk.
///
/// Decode failures are recovered per-chunk: the scheduler logs and drops the
/// chunk, and the virtual clock is unaffected beyond that chunk's absence.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload is not a whole number of codec units (e.g. a partial frame)
    Truncated(String),
    /// The payload could not be interpreted by this decoder
    Malformed(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated(msg) => write!(f, "truncated audio chunk: {}", msg),
            DecodeError::Malformed(msg) => write!(f, "malformed audio chunk: {}", msg),
        }
    }
}

/// One decoded audio chunk, ready to hand to the playback device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// Mono samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Sample rate of `samples` in Hz
    pub sample_rate: u32,
}

impl DecodedChunk {
    /// Playback duration of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Turns opaque codec payload bytes into playable samples.
///
/// The wire treats audio payloads as opaque, so the concrete codec (Opus,
/// PCM, ...) is pluggable behind this trait.
pub trait AudioDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<DecodedChunk, DecodeError>;
}

/// Reference decoder for 16-bit little-endian mono PCM payloads.
pub struct Pcm16Decoder {
    sample_rate: u32,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &[u8]) -> Result<DecodedChunk, DecodeError> {
        if payload.len() % 2 != 0 {
            return Err(DecodeError::Truncated(format!(
                "{} bytes is not a whole number of 16-bit samples",
                payload.len()
            )));
        }

        let mut cursor = Cursor::new(payload);
        let mut samples = Vec::with_capacity(payload.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample as f32 / i16::MAX as f32);
        }

        Ok(DecodedChunk {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// An audio output device with scheduled-start playback and its own clock.
///
/// This abstracts the platform audio API (the browser equivalent is an
/// `AudioContext`): `now()` reads the device clock, `play_at()` queues a
/// chunk to start at an absolute time on that clock. Implementations must
/// not block; the scheduler is called from the connection's event loop.
pub trait PlaybackDevice: Send {
    /// Current time on the device's clock domain.
    fn now(&self) -> Duration;

    /// Queue `chunk` to start playing exactly at `start` (device clock).
    fn play_at(&mut self, chunk: DecodedChunk, start: Duration);
}

/// Gapless playback scheduler over one [`PlaybackDevice`].
///
/// Owns the `next_play_at` cursor exclusively. Purely reactive: it never
/// suspends, every call runs to completion without blocking.
pub struct PlaybackScheduler<D: PlaybackDevice> {
    device: D,
    decoder: Box<dyn AudioDecoder>,

    /// Virtual clock cursor; `None` until the session's Ready handshake.
    next_play_at: Option<Duration>,

    /// Chunks dropped due to decode failures (diagnostics only)
    decode_failures: u64,
}

impl<D: PlaybackDevice> PlaybackScheduler<D> {
    pub fn new(device: D, decoder: Box<dyn AudioDecoder>) -> Self {
        Self {
            device,
            decoder,
            next_play_at: None,
            decode_failures: 0,
        }
    }

    /// Initialize the virtual clock to "now" on the device clock.
    ///
    /// Called exactly once per session, at the moment the `Ready` frame is
    /// processed. A second call on the same scheduler is a logic error
    /// upstream and is ignored so the cursor never moves backward.
    pub fn reset_clock(&mut self) {
        if self.next_play_at.is_some() {
            warn!("playback clock already initialized, ignoring reset");
            return;
        }
        let now = self.device.now();
        debug!(start = ?now, "playback clock initialized");
        self.next_play_at = Some(now);
    }

    /// Decode and schedule one arriving audio payload.
    ///
    /// Decode failures are swallowed per-chunk: one bad chunk never aborts
    /// the scheduler or desynchronizes the cursor beyond that chunk's own
    /// duration. Payloads arriving before the handshake are dropped.
    pub fn enqueue(&mut self, payload: &[u8]) {
        let cursor = match self.next_play_at {
            Some(cursor) => cursor,
            None => {
                debug!("dropping audio chunk received before handshake");
                return;
            }
        };

        let chunk = match self.decoder.decode(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.decode_failures += 1;
                warn!(error = %err, failures = self.decode_failures, "dropping undecodable chunk");
                return;
            }
        };

        let duration = chunk.duration();
        let now = self.device.now();
        // Catch up after a stall: never schedule into the past.
        let start = if cursor < now { now } else { cursor };

        self.device.play_at(chunk, start);
        self.next_play_at = Some(start + duration);
    }

    /// Tear down the per-session scheduling state when a session ends, so
    /// the next session's `Ready` handshake re-initializes a fresh cursor.
    pub fn end_session(&mut self) {
        self.next_play_at = None;
    }

    /// The current virtual clock cursor, if the session handshake happened.
    pub fn next_play_at(&self) -> Option<Duration> {
        self.next_play_at
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}
