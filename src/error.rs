use std::io;

use thiserror::Error;

/// The ways a control-channel exchange or a media packet can fail. Everything
///  a caller can usefully distinguish gets its own variant; transport-level
///  I/O failures are carried through unchanged.
#[derive(Debug, Error)]
pub enum RtspError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The server answered, but not with a success status (or the response
    ///  itself did not parse as a status line).
    #[error("server replied {code} {message}")]
    Protocol { code: u16, message: String },

    /// A datagram too short to hold the fixed RTP header.
    #[error("malformed media packet: {len} bytes")]
    MalformedPacket { len: usize },

    /// An operation that is not legal in the connection's current state, e.g.
    ///  PLAY before any stream is set up.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}
