// Inter-device link — protocol-level, board-independent.
//
// `syncom` is the synchronous bit-banged channel; `pickle` turns
// values into the 7-bit-clean zero-free byte streams it carries.

pub mod syncom;

#[cfg(feature = "serde")]
pub mod pickle;

pub use syncom::{LinkPhase, SynCom, BITS_PER_CH, DEFAULT_LATENCY, SYNC_CH};

use core::fmt;

/// Link-level failures, all surfaced synchronously to the caller of
/// the operation that hit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The liveness timeout expired; observed via
    /// [`SynCom::running`] and the rx poller reporting 2.
    Lost,
    /// The serializer refused a value, or produced bytes the wire
    /// cannot carry.
    Encode,
    /// A received buffer did not decode.
    Decode,
    /// A raw string holds a NUL, or non-ASCII in 7-bit mode.
    Payload,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Lost => write!(f, "link timed out"),
            LinkError::Encode => write!(f, "value not encodable for the wire"),
            LinkError::Decode => write!(f, "received buffer did not decode"),
            LinkError::Payload => write!(f, "payload byte outside the wire alphabet"),
        }
    }
}
