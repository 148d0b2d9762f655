//! Client side of a streaming-media session: an RTSP control channel for
//!  negotiating a stream, and an RTP datagram channel delivering the actual
//!  media frames, decoupled from network jitter by a reordering buffer and a
//!  fixed-rate playback scheduler.
//!
//! ## Design goals
//!
//! * Strict separation of the two halves:
//!   * [connection::RtspConnection] owns both network channels and the protocol
//!     state machine (SETUP / PLAY / PAUSE / TEARDOWN), plus the background
//!     task that receives and decodes RTP packets while a stream is playing
//!   * [session::Session] owns the reorder buffer, the buffering thresholds and
//!     the playback scheduler, and drives the connection based on buffer
//!     occupancy and user intent
//! * All session state is touched from exactly one task: user commands, frame
//!   arrival and render ticks are funneled through a single event queue, so
//!   their interleavings are totally ordered without any lock
//! * Frames are released to [session::SessionListener]s at a fixed cadence
//!   (40ms, i.e. 25 frames per second) in sequence-number order, regardless of
//!   arrival order; gaps are skipped silently after their playback slot passes
//! * Buffer occupancy is fed back to the server as flow control: the client
//!   stops requesting frames at 100 buffered frames and resumes below 80
//! * No congestion control, retransmission or encryption on the media channel;
//!   lost packets are simply skipped
//!
//! ## Control channel
//!
//! Plain-text requests over TCP, CRLF line endings, one outstanding request at
//!  a time:
//!
//! ```ascii
//! <METHOD> <media name> RTSP/1.0
//! CSeq: <n>
//! Session: <id>                          (PLAY / PAUSE / TEARDOWN only)
//! Transport: RTP/UDP; client_port= <p>   (SETUP only)
//! <blank line>
//! ```
//!
//! `CSeq` increases monotonically for the lifetime of the connection; the
//!  `Session` id is issued by the server in the SETUP response and cleared
//!  again at TEARDOWN.
//!
//! Responses are a status line `<version> <code> <message>` followed by
//!  `Name: value` header lines (names case-insensitive) and a blank line.
//!
//! ## Media packets
//!
//! RTP packets with the fixed 12-byte header, all multi-byte fields in network
//!  byte order:
//!
//! ```ascii
//! 0:  version / padding / CSRC count (not interpreted)
//! 1:  bit 7: marker, bits 6-0: payload type
//! 2:  sequence number (u16)
//! 4:  timestamp (u32)
//! 8:  SSRC (not interpreted)
//! 12: payload
//! ```
//!
//! A packet with a zero-length payload is the end-of-stream sentinel and is
//!  never delivered as a frame.

pub mod connection;
pub mod error;
pub mod frame;
pub mod frame_sink;
pub mod session;
pub mod wire;
