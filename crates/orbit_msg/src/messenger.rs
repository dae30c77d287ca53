//! The TCP ring messenger: connection registry, send paths, accept loop,
//! and per-connection frame dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use orbit_ring::{Node, Ring};

use crate::conn::{ConnState, RingConn};
use crate::frame::{FrameReader, FrameWriter, TcpFrameReader, TcpFrameWriter, DEFAULT_CHUNK_SIZE};
use crate::msg::{DoneGuard, Msg, MsgHandler};

/// Tuning knobs for the messenger.
#[derive(Clone, Copy, Debug)]
pub struct TcpMessengerOptions {
    /// Per-chunk I/O buffer size.
    pub chunk_size: usize,
    /// Bounds a single dial attempt.
    pub connection_timeout: Duration,
    /// Per-chunk read/write deadline while inside a frame.
    pub intra_message_timeout: Duration,
    /// Idle deadline while waiting for the next frame's first byte. Peers
    /// may stay quietly connected for hours; only a started frame is held
    /// to the short deadline.
    pub inter_message_timeout: Duration,
    /// Which of a node's published addresses to dial and listen on.
    pub address_index: usize,
}

impl Default for TcpMessengerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connection_timeout: Duration::from_secs(60),
            intra_message_timeout: Duration::from_secs(2),
            inter_message_timeout: Duration::from_secs(2 * 60 * 60),
            address_index: 0,
        }
    }
}

/// Backoff delays for `send_to_node`; the current delay is slept after
/// each failed attempt.
const SEND_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Accept poll deadline; keeps the listener responsive to shutdown.
const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Connection map and handler registry share one lock; handler lookups on
/// the hot path only ever take it for read.
struct Inner {
    conns: HashMap<SocketAddr, Arc<RingConn>>,
    handlers: HashMap<u64, Arc<dyn MsgHandler>>,
}

/// Point-to-point message transport over a [`Ring`].
///
/// One record per peer address, dialed on demand with single-flight
/// coalescing; inbound connections are accepted on the local node's
/// published address and read by a dedicated task each. All sends against
/// one connection serialize on its write lock, so frames never interleave
/// on the wire. Clones share all state.
#[derive(Clone)]
pub struct TcpMessenger {
    opts: TcpMessengerOptions,
    ring: Arc<RwLock<Arc<Ring>>>,
    inner: Arc<RwLock<Inner>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpMessenger {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self::with_options(ring, TcpMessengerOptions::default())
    }

    pub fn with_options(ring: Arc<Ring>, opts: TcpMessengerOptions) -> Self {
        Self {
            opts,
            ring: Arc::new(RwLock::new(ring)),
            inner: Arc::new(RwLock::new(Inner {
                conns: HashMap::new(),
                handlers: HashMap::new(),
            })),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The ring snapshot sends currently resolve against.
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().unwrap().clone()
    }

    /// Install a newer snapshot. Replica fan-outs carrying the old version
    /// are dropped from then on.
    pub fn set_ring(&self, ring: Arc<Ring>) {
        *self.ring.write().unwrap() = ring;
    }

    /// Frame lengths are unbounded on the wire; the type's range is the
    /// only cap.
    pub fn max_msg_length(&self) -> u64 {
        u64::MAX
    }

    /// Register the decoder for a message-type tag. Handlers are
    /// registered before [`listen`](Self::listen); an unregistered tag
    /// arriving on the wire drops that connection.
    pub fn set_msg_handler(&self, msg_type: u64, handler: Arc<dyn MsgHandler>) {
        self.inner.write().unwrap().handlers.insert(msg_type, handler);
    }

    /// Send `msg` to the node with `node_id`, retrying with backoff while
    /// the connection comes up. `done` fires exactly once, whether or not
    /// a send succeeded.
    pub async fn send_to_node(&self, node_id: u64, msg: Arc<dyn Msg>) {
        let _done = DoneGuard::new(msg.clone());
        for delay in SEND_RETRY_DELAYS {
            if let Some(node) = self.ring().node(node_id) {
                match self.send_msg(&node, msg.as_ref()).await {
                    Ok(()) => return,
                    Err(err) => debug!(node_id, error = ?err, "send attempt failed"),
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Fan `msg` out to every node responsible for `partition` except the
    /// local one, then fire `done` once. The whole send is dropped when
    /// `ring_version` no longer matches the live ring; the caller's view
    /// of the replica set is stale and must not be trusted.
    pub async fn send_to_other_replicas(&self, ring_version: i64, partition: u32, msg: Arc<dyn Msg>) {
        let _done = DoneGuard::new(msg.clone());
        let ring = self.ring();
        if ring.version() != ring_version {
            debug!(
                ring_version,
                live_version = ring.version(),
                "dropping fan-out against a stale ring"
            );
            return;
        }
        let local_id = ring.local_node().map_or(0, |node| node.node_id());
        let targets: Vec<Arc<dyn Node>> = ring
            .responsible_nodes(partition)
            .into_iter()
            .flatten()
            .filter(|node| node.node_id() != local_id)
            .collect();
        if targets.is_empty() {
            return;
        }
        // One task per target; completions funnel through a channel sized
        // to the fan-out degree. Individual failures never abort the rest.
        let (complete_tx, mut complete_rx) = mpsc::channel(targets.len());
        for node in targets {
            let messenger = self.clone();
            let msg = msg.clone();
            let complete = complete_tx.clone();
            self.tasks.spawn(async move {
                if let Err(err) = messenger.send_msg(&node, msg.as_ref()).await {
                    debug!(node_id = node.node_id(), error = ?err, "replica send failed");
                }
                let _ = complete.send(()).await;
            });
        }
        drop(complete_tx);
        while complete_rx.recv().await.is_some() {}
    }

    /// One send attempt: resolve the address, take the connection if it is
    /// up, and write the frame under the write lock. Any failure past the
    /// lookup evicts the connection.
    async fn send_msg(&self, node: &Arc<dyn Node>, msg: &dyn Msg) -> anyhow::Result<()> {
        let addr = node.address(self.opts.address_index).with_context(|| {
            format!(
                "node {} has no address at index {}",
                node.node_id(),
                self.opts.address_index
            )
        })?;
        let conn = self
            .connection(addr)
            .with_context(|| format!("connection to {addr} not ready"))?;
        let mut writer_slot = conn.writer.lock().await;
        let writer = writer_slot
            .as_mut()
            .with_context(|| format!("connection to {addr} closed"))?;
        if let Err(err) = write_frame(writer, msg).await {
            warn!(%addr, error = ?err, "send failed");
            self.evict(&conn);
            return Err(err);
        }
        Ok(())
    }

    /// Fetch the connected record for `addr`. When no record exists, a
    /// `CONNECTING` placeholder is inserted and the dial happens on its
    /// own task; this and every other lookup during the dial window get
    /// `None` and retry on their own schedule; nobody waits on the dial.
    fn connection(&self, addr: SocketAddr) -> Option<Arc<RingConn>> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(conn) = inner.conns.get(&addr) {
                return (conn.state() == ConnState::Connected).then(|| conn.clone());
            }
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(conn) = inner.conns.get(&addr) {
            return (conn.state() == ConnState::Connected).then(|| conn.clone());
        }
        let conn = RingConn::connecting(addr);
        inner.conns.insert(addr, conn.clone());
        drop(inner);
        let messenger = self.clone();
        self.tasks.spawn(async move {
            messenger.dial(addr, conn).await;
        });
        None
    }

    async fn dial(self, addr: SocketAddr, conn: Arc<RingConn>) {
        let stream =
            match tokio::time::timeout(self.opts.connection_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(%addr, error = ?err, "dial failed");
                    self.remove_if_current(addr, &conn);
                    return;
                }
                Err(_) => {
                    debug!(%addr, "dial timed out");
                    self.remove_if_current(addr, &conn);
                    return;
                }
            };
        let (read_half, write_half) = stream.into_split();
        let reader =
            FrameReader::new(read_half, self.opts.chunk_size, self.opts.intra_message_timeout);
        let writer =
            FrameWriter::new(write_half, self.opts.chunk_size, self.opts.intra_message_timeout);
        *conn.writer.lock().await = Some(writer);
        if let Err(err) = self.handshake(&conn).await {
            warn!(%addr, error = ?err, "handshake failed");
            self.remove_if_current(addr, &conn);
            return;
        }
        let messenger = self.clone();
        self.tasks.spawn(async move {
            messenger.handle_forever(conn, reader).await;
        });
    }

    /// Connection handshake; currently a no-op that marks the record
    /// connected.
    ///
    /// TODO: exchange protocol versions and node ids here, then re-key
    /// inbound records by peer identity instead of remote socket address.
    async fn handshake(&self, conn: &Arc<RingConn>) -> anyhow::Result<()> {
        conn.set_state(ConnState::Connected);
        Ok(())
    }

    /// Drop `conn` from the registry (unless a replacement already took
    /// its key) and close its stream.
    fn evict(&self, conn: &Arc<RingConn>) {
        conn.set_state(ConnState::Disconnecting);
        self.remove_if_current(conn.addr, conn);
        conn.close();
    }

    fn remove_if_current(&self, addr: SocketAddr, conn: &Arc<RingConn>) {
        let mut inner = self.inner.write().unwrap();
        if inner
            .conns
            .get(&addr)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            inner.conns.remove(&addr);
        }
    }

    /// Bind the local node's published address and spawn the accept loop.
    /// Returns the bound address (useful when the published port is 0).
    pub async fn listen(&self) -> anyhow::Result<SocketAddr> {
        let ring = self.ring();
        let node = ring
            .local_node()
            .context("ring has no local node to listen as")?;
        let addr = node.address(self.opts.address_index).with_context(|| {
            format!(
                "local node {} has no address at index {}",
                node.node_id(),
                self.opts.address_index
            )
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "listening");
        let messenger = self.clone();
        self.tasks.spawn(async move {
            messenger.accept_loop(listener).await;
        });
        Ok(local_addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("stopping listener");
                    return;
                }
                accepted = tokio::time::timeout(ACCEPT_DEADLINE, listener.accept()) => accepted,
            };
            match accepted {
                Ok(Ok((stream, peer))) => self.accept_conn(stream, peer).await,
                Ok(Err(err)) => {
                    warn!(error = ?err, "accept failed");
                    return;
                }
                // Poll deadline; loop around and observe shutdown.
                Err(_) => continue,
            }
        }
    }

    /// Install an accepted connection keyed by the peer's remote socket
    /// address. Inbound wins any collision: an existing record at that
    /// key, connecting or connected, is closed and replaced.
    ///
    /// TODO: inbound records are keyed by the remote socket address while
    /// outbound records use the node's published address, so the two can
    /// coexist without coalescing; fold them together once the handshake
    /// exchanges node ids.
    async fn accept_conn(&self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let reader =
            FrameReader::new(read_half, self.opts.chunk_size, self.opts.intra_message_timeout);
        let writer =
            FrameWriter::new(write_half, self.opts.chunk_size, self.opts.intra_message_timeout);
        let conn = RingConn::connecting(peer);
        *conn.writer.lock().await = Some(writer);
        let replaced = self.inner.write().unwrap().conns.insert(peer, conn.clone());
        if let Some(replaced) = replaced {
            debug!(%peer, "inbound connection replaces existing record");
            replaced.set_state(ConnState::Disconnecting);
            replaced.close();
        }
        if let Err(err) = self.handshake(&conn).await {
            warn!(%peer, error = ?err, "handshake failed");
            self.remove_if_current(peer, &conn);
            return;
        }
        let messenger = self.clone();
        self.tasks.spawn(async move {
            messenger.handle_forever(conn, reader).await;
        });
    }

    /// Read frames until shutdown, eviction, or error.
    async fn handle_forever(self, conn: Arc<RingConn>, mut reader: TcpFrameReader) {
        loop {
            match self.handle_one(&conn, &mut reader).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    debug!(addr = %conn.addr, error = ?err, "connection failed");
                    self.evict(&conn);
                    return;
                }
            }
        }
    }

    /// Process one frame. `Ok(false)` means the loop should stop without
    /// treating it as a connection failure (shutdown or eviction).
    async fn handle_one(
        &self,
        conn: &Arc<RingConn>,
        reader: &mut TcpFrameReader,
    ) -> anyhow::Result<bool> {
        // Idle regime while waiting for a frame to start. Shutdown and
        // eviction are only honored here; a frame in flight always runs
        // out its own deadline.
        reader.set_timeout(self.opts.inter_message_timeout);
        let first = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(false),
            _ = conn.closed.cancelled() => return Ok(false),
            byte = reader.read_byte() => byte?,
        };
        // Intra-message regime from the second byte of the header onward.
        reader.set_timeout(self.opts.intra_message_timeout);
        let mut msg_type = u64::from(first);
        for _ in 1..8 {
            msg_type = msg_type << 8 | u64::from(reader.read_byte().await?);
        }
        let length = reader.read_u64().await?;
        let handler = self
            .inner
            .read()
            .unwrap()
            .handlers
            .get(&msg_type)
            .cloned()
            .with_context(|| format!("no handler for msg type {msg_type:#x}"))?;
        let consumed = handler.unmarshal(reader, length).await?;
        anyhow::ensure!(
            consumed == length,
            "handler consumed {consumed} bytes of a {length} byte message"
        );
        Ok(true)
    }

    /// Signal every loop to stop and wait for all spawned tasks (the
    /// listener, dialers, and per-connection readers) to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Write one `header + payload + flush` sequence. The caller holds the
/// connection's write lock for the whole call.
async fn write_frame(writer: &mut TcpFrameWriter, msg: &dyn Msg) -> anyhow::Result<()> {
    writer.write_u64(msg.msg_type()).await?;
    writer.write_u64(msg.msg_length()).await?;
    let written = msg.write_content(writer).await?;
    writer.flush().await?;
    anyhow::ensure!(
        written == msg.msg_length(),
        "incorrect message length sent: {written} != {}",
        msg.msg_length()
    );
    Ok(())
}
