//! Point-to-point TCP messaging over a partition ring.
//!
//! The messenger keeps one persistent bidirectional connection per peer
//! address. Frames are `(msg_type u64, length u64, payload)` in network
//! byte order, dispatched to handlers registered by message-type tag.
//! Replica fan-out validates the caller's ring version so a send never
//! targets stale membership.

mod conn;
mod frame;
mod messenger;
mod msg;

pub use frame::{FrameReader, FrameWriter, TcpFrameReader, TcpFrameWriter};
pub use messenger::{TcpMessenger, TcpMessengerOptions};
pub use msg::{Msg, MsgHandler};
