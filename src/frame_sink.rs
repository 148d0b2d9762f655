use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::frame::Frame;

/// Callback for decoded media packets, implemented by whoever consumes frames
///  off the datagram channel. Invoked from the receive task, so implementations
///  must not block on state that a control-channel operation can hold.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn on_frame(&self, frame: Frame);

    /// The end-of-stream sentinel was received. `sequence_number` is the
    ///  sentinel's own sequence number; no frame beyond it will arrive.
    async fn on_stream_ended(&self, sequence_number: u16);
}
