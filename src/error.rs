//! Error types for the SPICE client.
//!
//! Only handshake and connector failures propagate to the orchestrator;
//! everything that happens inside an established channel is confined to
//! that channel and logged.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the SPICE client.
#[derive(Debug, Error)]
pub enum SpiceError {
    // ── Framing (fatal for the channel) ──────────────────────────
    /// The peer sent bytes that do not start with the expected magic.
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// A message declared a payload larger than the 10 MiB bound.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame or embedded structure was shorter than its own header claims.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// A sub-list entry points outside the carrying payload.
    #[error("malformed sub-list in frame")]
    MalformedSubList,

    // ── Handshake (fatal for channel setup) ──────────────────────
    /// The server rejected the link with a protocol error code.
    #[error("link rejected: {0}")]
    Link(#[from] LinkError),

    /// The link reply exceeded the allowed size.
    #[error("link reply too large: {0} bytes")]
    LinkReplyTooLarge(u32),

    /// The server's RSA public key could not be parsed.
    #[error("invalid server public key: {0}")]
    InvalidPublicKey(String),

    /// RSA-OAEP encryption of the ticket failed.
    #[error("ticket encryption failed: {0}")]
    TicketEncryption(String),

    // ── Decode (transient, the draw is skipped) ──────────────────
    /// An image payload used a type code this client does not decode.
    #[error("unsupported image type {0}")]
    UnsupportedImageType(u8),

    /// A bitmap payload used an unsupported pixel format.
    #[error("unsupported bitmap format {0}")]
    UnsupportedBitmapFormat(u8),

    /// The LZ stream is corrupt (bad magic, bad type, or a back
    /// reference before the start of output).
    #[error("lz decode error: {0}")]
    Lz(String),

    /// The QUIC stream is corrupt.
    #[error("quic decode error: {0}")]
    Quic(String),

    /// JPEG decoding failed.
    #[error("jpeg decode error: {0}")]
    Jpeg(String),

    // ── Runtime ──────────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel's writer went away.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Audio output/input/codec failure.
    #[error("sound error: {0}")]
    Sound(#[from] SoundError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for SpiceError {
    fn from(s: String) -> Self {
        SpiceError::Other(s)
    }
}

impl From<&str> for SpiceError {
    fn from(s: &str) -> Self {
        SpiceError::Other(s.to_string())
    }
}

// ── LinkError ────────────────────────────────────────────────────

/// Error codes carried in the link reply and the ticket ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("spice link: error")]
    Error,
    #[error("spice link: invalid magic")]
    InvalidMagic,
    #[error("spice link: invalid data")]
    InvalidData,
    #[error("spice link: version mismatch")]
    VersionMismatch,
    #[error("spice link: need secured")]
    NeedSecured,
    #[error("spice link: need unsecured")]
    NeedUnsecured,
    #[error("spice link: permission denied")]
    PermissionDenied,
    #[error("spice link: bad connection id")]
    BadConnectionId,
    #[error("spice link: channel not available")]
    ChannelNotAvailable,
    #[error("spice link: unknown error {0}")]
    Unknown(u32),
}

impl LinkError {
    /// Map a wire error code to `Ok(())` or the matching error.
    pub fn check(code: u32) -> Result<(), LinkError> {
        match code {
            0 => Ok(()),
            1 => Err(LinkError::Error),
            2 => Err(LinkError::InvalidMagic),
            3 => Err(LinkError::InvalidData),
            4 => Err(LinkError::VersionMismatch),
            5 => Err(LinkError::NeedSecured),
            6 => Err(LinkError::NeedUnsecured),
            7 => Err(LinkError::PermissionDenied),
            8 => Err(LinkError::BadConnectionId),
            9 => Err(LinkError::ChannelNotAvailable),
            n => Err(LinkError::Unknown(n)),
        }
    }
}

// ── SoundError ───────────────────────────────────────────────────

/// Errors surfaced by the pluggable audio backend.
#[derive(Debug, Error)]
pub enum SoundError {
    /// The output could not keep up; the caller retries shortly.
    #[error("output underrun")]
    Underrun,

    /// Opus packet could not be decoded / PCM could not be encoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Opening or using the audio device failed.
    #[error("device error: {0}")]
    Device(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_error_codes() {
        assert!(LinkError::check(0).is_ok());
        assert_eq!(LinkError::check(7), Err(LinkError::PermissionDenied));
        assert_eq!(LinkError::check(42), Err(LinkError::Unknown(42)));
    }

    #[test]
    fn display_messages() {
        let e = SpiceError::PayloadTooLarge { size: 11 << 20, max: 10 << 20 };
        assert!(e.to_string().contains("max"));

        let e = SpiceError::UnsupportedImageType(104);
        assert!(e.to_string().contains("104"));
    }
}
