use std::fmt;
use std::io;

/// Errors surfaced by the media server's public API and data path.
///
/// Nothing on the data path is fatal: `InvalidHeader`, `UnsupportedCodec`,
/// `ResampleError` and `SinkError` are handled internally (dropped frame,
/// counter increment, log) and never escape to a caller. Only the variants
/// that correspond to a public operation failing outright are returned.
#[derive(Debug)]
pub enum MediaServerError {
    /// `SendAudio` referenced a `call_id` with no session, or a session
    /// whose remote endpoint has not yet been learned from an inbound
    /// packet.
    UnknownSession,
    /// A public operation was invoked after `Stop` completed.
    ServerStopped,
    /// `Start` could not bind the configured UDP address.
    BindError(io::Error),
    /// A runtime socket send failed.
    IoError(io::Error),
}

impl fmt::Display for MediaServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession => write!(f, "unknown session"),
            Self::ServerStopped => write!(f, "server is stopped"),
            Self::BindError(e) => write!(f, "failed to bind udp socket: {e}"),
            Self::IoError(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for MediaServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindError(e) | Self::IoError(e) => Some(e),
            Self::UnknownSession | Self::ServerStopped => None,
        }
    }
}

/// Internal, non-fatal faults raised by individual components on the data
/// path. Callers of these components turn every variant into a pass-through
/// plus a counter increment rather than propagating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// `version != 2`, datagram shorter than 12 bytes, or the declared
    /// CSRC count runs past the end of the datagram.
    InvalidHeader,
    /// The configured codec does not match a known payload decoder/encoder.
    UnsupportedCodec,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid rtp header"),
            Self::UnsupportedCodec => write!(f, "unsupported codec"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Raised by the resampler (C2) when a chunk cannot be interpreted as
/// whole PCM16 samples. Callers pass the frame through unresampled and
/// bump `Statistics::record_resample_failure` rather than propagating
/// this further (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleError {
    /// Input byte length is not a multiple of 2, so it cannot be split
    /// into whole little-endian PCM16 samples.
    MalformedInput,
}

impl fmt::Display for ResampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedInput => write!(f, "malformed resampler input: odd byte length"),
        }
    }
}

impl std::error::Error for ResampleError {}
