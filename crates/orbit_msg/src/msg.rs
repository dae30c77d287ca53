//! Message and handler capability traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::frame::{TcpFrameReader, TcpFrameWriter};

/// An outbound message. The transport never interprets the payload; it
/// frames the type tag and length, then streams the content.
#[async_trait]
pub trait Msg: Send + Sync + 'static {
    /// Tag used by the receiver to pick a registered handler.
    fn msg_type(&self) -> u64;

    /// Declared payload length. `write_content` must produce exactly this
    /// many bytes or the send fails and the connection is dropped.
    fn msg_length(&self) -> u64;

    /// Stream the payload into the framed writer, returning the number of
    /// bytes written.
    async fn write_content(&self, writer: &mut TcpFrameWriter) -> anyhow::Result<u64>;

    /// Completion callback. The messenger fires this exactly once per send
    /// operation, successful or not; implementations typically recycle
    /// buffers or signal the producer here.
    fn done(&self);
}

/// Inbound frame decoder, registered per message-type tag.
#[async_trait]
pub trait MsgHandler: Send + Sync + 'static {
    /// Decode one payload of exactly `length` bytes from the reader,
    /// returning how many bytes were consumed. Consuming any other amount
    /// is a protocol violation and drops the connection.
    async fn unmarshal(&self, reader: &mut TcpFrameReader, length: u64) -> anyhow::Result<u64>;
}

/// Fires [`Msg::done`] exactly once when the send path unwinds, no matter
/// which exit it takes.
pub(crate) struct DoneGuard(Option<Arc<dyn Msg>>);

impl DoneGuard {
    pub(crate) fn new(msg: Arc<dyn Msg>) -> Self {
        Self(Some(msg))
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(msg) = self.0.take() {
            msg.done();
        }
    }
}
