//! Per-peer connection records.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::frame::TcpFrameWriter;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
}

/// One record per peer address.
///
/// The framed writer sits behind an async mutex; holding it across a full
/// frame is what serializes senders and keeps frames interleaving-free.
/// The framed reader is owned by the connection's read task and never
/// stored here; a single dedicated reader per connection needs no lock.
pub(crate) struct RingConn {
    pub(crate) addr: SocketAddr,
    state: AtomicU8,
    /// `None` until the dial completes and the stream is installed, and
    /// again after eviction closes the write half.
    pub(crate) writer: Mutex<Option<TcpFrameWriter>>,
    /// Cancelled when the record is evicted so the read task stops at the
    /// next frame boundary.
    pub(crate) closed: CancellationToken,
}

impl RingConn {
    /// A fresh record in the `CONNECTING` state with no stream yet.
    pub(crate) fn connecting(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            writer: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            _ => ConnState::Disconnecting,
        }
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Tear the record down: drop the write half (sending FIN) when no
    /// sender holds it, and signal the read task. A sender that does hold
    /// the write lock drops the writer with the record instead.
    pub(crate) fn close(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
        self.closed.cancel();
    }
}
