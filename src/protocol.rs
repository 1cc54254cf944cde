//! # Wire Protocol Frame Codec
//!
//! Encodes and decodes the framed binary protocol used on every WebSocket
//! message in both directions (browser ↔ relay ↔ speech backend).
//!
//! ## Frame Layout:
//! - **Byte 0**: frame kind (`0x00` = Ready, `0x01` = Audio, `0x02` = Text)
//! - **Bytes 1..**: payload (empty for Ready, codec audio bytes for Audio,
//!   UTF-8 text for Text)
//!
//! ## Forward Compatibility:
//! The backend may introduce new binary sub-kinds at any time, so every kind
//! byte this codec does not recognize decodes as `Audio`. A message with zero
//! total bytes carries no kind byte at all; it decodes to the `Empty` sentinel
//! and callers must treat it as a no-op, never as an error.

/// The kind of a protocol frame, carried in the first byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Backend-readiness handshake. Sent exactly once per connection with an
    /// empty payload once the backend has warmed up.
    Ready,
    /// An encoded audio chunk (opaque codec bytes, e.g. Opus or PCM).
    Audio,
    /// A UTF-8 text token fragment.
    Text,
}

impl FrameKind {
    /// Parse a kind byte. Unknown values map to `Audio` by protocol
    /// convention so newer backends keep working against this codec.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => FrameKind::Ready,
            0x02 => FrameKind::Text,
            _ => FrameKind::Audio,
        }
    }

    /// The canonical wire value for this kind.
    pub fn as_byte(&self) -> u8 {
        match self {
            FrameKind::Ready => 0x00,
            FrameKind::Audio => 0x01,
            FrameKind::Text => 0x02,
        }
    }
}

/// Result of decoding one WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// The message had zero total bytes. Not an error; yields no action.
    Empty,
    /// A well-formed frame: kind byte plus (possibly empty) payload.
    Frame { kind: FrameKind, payload: &'a [u8] },
}

/// Encode a frame: one kind byte prepended to the payload.
///
/// This performs a single allocation and copy; the payload is treated as
/// opaque bytes and is never inspected.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(kind.as_byte());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a message by splitting the kind byte from the remainder.
///
/// Never fails: zero-length input yields [`Decoded::Empty`], every other
/// input is a frame (unknown kind bytes become `Audio`).
pub fn decode(bytes: &[u8]) -> Decoded<'_> {
    match bytes.split_first() {
        None => Decoded::Empty,
        Some((kind, payload)) => Decoded::Frame {
            kind: FrameKind::from_byte(*kind),
            payload,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_kinds() {
        for kind in [FrameKind::Ready, FrameKind::Audio, FrameKind::Text] {
            for payload in [&b""[..], &b"\x00\x01\x02"[..], &[0xffu8; 64][..]] {
                let encoded = encode(kind, payload);
                assert_eq!(encoded.len(), 1 + payload.len());
                match decode(&encoded) {
                    Decoded::Frame { kind: k, payload: p } => {
                        assert_eq!(k, kind);
                        assert_eq!(p, payload);
                    }
                    Decoded::Empty => panic!("nonempty frame decoded as empty"),
                }
            }
        }
    }

    #[test]
    fn test_empty_input_is_noop_sentinel() {
        assert_eq!(decode(&[]), Decoded::Empty);
    }

    #[test]
    fn test_unknown_kinds_decode_as_audio() {
        for byte in [0x03u8, 0x10, 0x7f, 0xff] {
            match decode(&[byte, 1, 2, 3]) {
                Decoded::Frame { kind, payload } => {
                    assert_eq!(kind, FrameKind::Audio);
                    assert_eq!(payload, &[1, 2, 3]);
                }
                Decoded::Empty => panic!("nonempty frame decoded as empty"),
            }
        }
    }

    #[test]
    fn test_kind_only_frame_has_empty_payload() {
        match decode(&[0x00]) {
            Decoded::Frame { kind, payload } => {
                assert_eq!(kind, FrameKind::Ready);
                assert!(payload.is_empty());
            }
            Decoded::Empty => panic!("one-byte frame decoded as empty"),
        }
    }
}
