//! # Voice Relay Backend
//!
//! Full-duplex voice conversation plumbing in two halves:
//!
//! - **Server half**: an actix-web relay that terminates a browser WebSocket
//!   at `/ws/voice` and forwards raw frames to a speech backend running
//!   behind self-signed TLS ([`relay`]), plus health/metrics/config HTTP
//!   endpoints ([`health`], [`handlers`]).
//! - **Client half**: the framed wire protocol ([`protocol`]), the session
//!   state machine ([`session`]) and the capture/playback/text pipelines
//!   ([`client`]) that a native frontend binds to its audio devices.
//!
//! The two halves share the wire protocol: byte 0 of every binary message is
//! a frame kind (`Ready`, `Audio`, `Text`), the rest is payload.

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
