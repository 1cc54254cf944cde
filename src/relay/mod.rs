//! # Relay Proxy Module
//!
//! Terminates one WebSocket from the browser (`/ws/voice`) and opens a second
//! WebSocket to the configured speech backend, forwarding raw binary frames
//! unchanged in both directions until either side closes.
//!
//! ## Why a relay at all:
//! The public-facing page is served over a different trust boundary than the
//! backend, which runs behind self-signed TLS. Browsers refuse that mix
//! (mixed content / untrusted certificate), so this same-origin relay carries
//! the bytes instead. It performs no protocol interpretation whatsoever.
//!
//! ## Connection Lifecycle:
//! 1. Browser connects; query parameters (voice, persona, ...) are kept
//! 2. The backend leg is dialed with a bounded timeout
//! 3. Two pumps forward frames concurrently, one per direction
//! 4. Either leg closing or failing tears down the other with a matching or
//!    derived close code; reconnection is the client's responsibility

pub mod proxy;

pub use proxy::{voice_relay, RelayWebSocket};
