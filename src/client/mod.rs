//! # Voice Client Pipeline
//!
//! The client half of the full-duplex relay: everything a conversation
//! frontend needs between its audio devices and the relay socket.
//!
//! ## Key Components:
//! - **Capture Pipeline**: timer-driven microphone chunks framed as `Audio`
//! - **Playback Scheduler**: gapless virtual-clock scheduling of inbound audio
//! - **Text Aggregator**: debounced assembly of sub-word tokens into utterances
//! - **Voice Client**: one task binding the above to a session state machine
//!   and a WebSocket transport
//!
//! ## Device Abstractions:
//! Platform audio APIs are bound through two traits: [`capture::CaptureDevice`]
//! ("capture device with chunked callback") and [`playback::PlaybackDevice`]
//! ("output device with scheduled-start playback and its own clock"). The
//! browser equivalents are `MediaRecorder` and `AudioContext`.

pub mod capture;
pub mod playback;
pub mod text;
pub mod voice;

pub use capture::{CaptureDevice, CaptureError, CapturePipeline};
pub use playback::{AudioDecoder, DecodedChunk, Pcm16Decoder, PlaybackDevice, PlaybackScheduler};
pub use text::TextAggregator;
pub use voice::{VoiceClient, VoiceClientConfig, VoiceClientHandle};
