use std::fmt::{Debug, Formatter};

use bytes::{Buf, Bytes};

use crate::error::RtspError;

/// Fixed part of every RTP packet that precedes the payload.
pub const RTP_HEADER_LEN: usize = 12;

/// A single decoded media frame, i.e. the interpreted header fields of an RTP
///  packet plus its (possibly empty) payload.
///
/// Ordering and playback scheduling are based solely on the sequence number;
///  the timestamp is carried through for listeners but not interpreted.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    payload_type: u8,
    marker: bool,
    sequence_number: u16,
    timestamp: u32,
    payload: Bytes,
}

impl Frame {
    pub fn new(
        payload_type: u8,
        marker: bool,
        sequence_number: u16,
        timestamp: u32,
        payload: Bytes,
    ) -> Frame {
        Frame {
            payload_type,
            marker,
            sequence_number,
            timestamp,
            payload,
        }
    }

    /// Decode a raw datagram. Only the length is validated; the version and
    ///  SSRC fields are skipped without interpretation.
    pub fn parse(data: &[u8]) -> Result<Frame, RtspError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtspError::MalformedPacket { len: data.len() });
        }

        let mut buf = data;
        let _flags = buf.get_u8();
        let marker_and_type = buf.get_u8();
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let _ssrc = buf.get_u32();

        Ok(Frame {
            payload_type: marker_and_type & 0x7f,
            marker: marker_and_type & 0x80 != 0,
            sequence_number,
            timestamp,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// A zero-length payload marks the end of the stream; such a packet is a
    ///  sentinel, not a frame to play.
    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame{{pt:{},m:{},seq:{},ts:{},payload:{}B}}",
            self.payload_type,
            self.marker,
            self.sequence_number,
            self.timestamp,
            self.payload.len()
        )
    }
}
