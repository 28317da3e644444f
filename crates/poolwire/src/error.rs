//! Decode-side error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The first two bytes were not the protocol magic.
    #[error("bad magic 0x{found:04x}, expected 0x{expected:04x}")]
    BadMagic { found: u16, expected: u16 },

    /// The peer speaks an older (or unknown) protocol revision.
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// The message type byte maps to no known message.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The priority byte maps to no known class.
    #[error("unknown priority {0}")]
    UnknownPriority(u8),

    /// The buffer ended before the advertised length.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The advertised payload exceeds the configured ceiling.
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    /// Payload bytes remained after the typed body was fully parsed.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

impl WireError {
    /// True for errors that poison the connection: the framing itself is
    /// unreliable, so no further message on this stream can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. } | Self::UnsupportedVersion { .. }
        )
    }
}
