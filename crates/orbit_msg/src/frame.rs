//! Buffered frame I/O with chunk-level timeouts.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

/// Default per-chunk I/O buffer size.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// The reader type handlers decode payloads from.
pub type TcpFrameReader = FrameReader<OwnedReadHalf>;
/// The writer type messages stream their content into.
pub type TcpFrameWriter = FrameWriter<OwnedWriteHalf>;

/// Buffered reader that bounds every chunk-level read with its current
/// timeout.
///
/// The read loop switches between two regimes: a long idle deadline while
/// waiting for the first byte of the next frame, and a short intra-message
/// deadline for every byte after it. The switch happens exactly at the
/// first byte; [`set_timeout`](Self::set_timeout) is how the owner flips
/// regimes.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    chunk_size: usize,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            timeout,
        }
    }

    /// Replace the deadline applied to each subsequent chunk read.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Pull the next chunk off the stream into the buffer.
    async fn fill(&mut self) -> io::Result<()> {
        self.buf.reserve(self.chunk_size);
        match timeout(self.timeout, self.inner.read_buf(&mut self.buf)).await {
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        }
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.get_u8())
    }

    pub async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = self.buf.len().min(out.len() - filled);
            self.buf.copy_to_slice(&mut out[filled..filled + take]);
            filled += take;
        }
        Ok(())
    }

    /// Read a big-endian u64.
    pub async fn read_u64(&mut self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes).await?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Discard exactly `count` bytes. Handlers use this to skip payloads
    /// they recognize but do not need.
    pub async fn skip(&mut self, count: u64) -> io::Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            self.buf.advance(take);
            remaining -= take as u64;
        }
        Ok(())
    }
}

/// Buffered writer that bounds every chunk-level write with a fixed
/// timeout.
///
/// Bytes accumulate in the buffer and drain a chunk at a time; nothing is
/// guaranteed on the wire until [`flush`](Self::flush). Writers are not
/// thread-safe: the caller holds the connection's write lock across one
/// frame's `header + payload + flush` sequence, which is what keeps frames
/// atomic on the wire.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    chunk_size: usize,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            timeout,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() >= self.chunk_size {
                self.drain().await?;
            }
        }
        Ok(())
    }

    /// Write a big-endian u64.
    pub async fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_all(&value.to_be_bytes()).await
    }

    /// Push everything buffered onto the wire.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.drain().await?;
        match timeout(self.timeout, self.inner.flush()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "flush timed out")),
        }
    }

    async fn drain(&mut self) -> io::Result<()> {
        while !self.buf.is_empty() {
            let written = match timeout(self.timeout, self.inner.write(&self.buf)).await {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed",
                    ))
                }
                Ok(Ok(written)) => written,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
            };
            self.buf.advance(written);
        }
        Ok(())
    }
}
