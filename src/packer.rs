// src/packer.rs
//! Packet transport adapter: the sole reader and writer of the physical
//! connection.
//!
//! The read path and the write path sit behind independent async locks,
//! so inbound and outbound traffic never block each other but never
//! interleave with themselves. Close is a one-shot status transition
//! (`Open → Closing → Closed`); both paths observe it so that the
//! errors a dying connection produces are not surfaced once shutdown
//! was asked for.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::codec::{DEFAULT_MAX_BODY_LEN, Packet, PacketReader, PacketWriter};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closing,
    Closed,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Open,
            1 => Status::Closing,
            _ => Status::Closed,
        }
    }
}

type BoxRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxWrite = Box<dyn AsyncWrite + Unpin + Send>;

struct PackerInner {
    reader: AsyncMutex<PacketReader<BoxRead>>,
    writer: AsyncMutex<PacketWriter<BoxWrite>>,
    status: AtomicU8,
    /// Raised by `close` to resolve a blocked read as end of stream.
    closing: Notify,
}

/// Turns a raw duplex byte connection into framed [`Packet`] values.
#[derive(Clone)]
pub struct Packer {
    inner: Arc<PackerInner>,
}

impl std::fmt::Debug for Packer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packer")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Packer {
    /// Wrap a combined duplex connection.
    pub fn new<S>(conn: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (r, w) = tokio::io::split(conn);
        Self::from_split(r, w)
    }

    /// Wrap separate read and write halves, such as stdin/stdout.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_max_body_len(reader, writer, DEFAULT_MAX_BODY_LEN)
    }

    /// Wrap split halves with a custom inbound body cap.
    pub fn with_max_body_len<R, W>(reader: R, writer: W, max_body_len: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Arc::new(PackerInner {
                reader: AsyncMutex::new(PacketReader::with_max_body_len(
                    Box::new(reader) as BoxRead,
                    max_body_len,
                )),
                writer: AsyncMutex::new(PacketWriter::new(Box::new(writer) as BoxWrite)),
                status: AtomicU8::new(Status::Open as u8),
                closing: Notify::new(),
            }),
        }
    }

    /// A connected in-memory pair, for tests and in-process peers.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::new(a), Self::new(b))
    }

    fn status(&self) -> Status {
        Status::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Whether close has been requested.
    pub fn is_closing(&self) -> bool {
        self.status() != Status::Open
    }

    /// Read the next packet. `Ok(None)` marks end of stream: the peer
    /// closed cleanly, or close was requested locally — in the latter
    /// case a read error from the dying connection is suppressed too,
    /// since it only reports the shutdown we asked for.
    pub async fn next(&self) -> Result<Option<Packet>, TransportError> {
        let mut reader = self.inner.reader.lock().await;

        // Register for the close signal before checking status, so a
        // close that lands in between cannot be missed.
        let mut closing = pin!(self.inner.closing.notified());
        closing.as_mut().enable();
        if self.is_closing() {
            return Ok(None);
        }

        let result = tokio::select! {
            result = reader.read_packet() => result,
            _ = closing => return Ok(None),
        };
        match result {
            Ok(pkt) => Ok(pkt),
            Err(_) if self.is_closing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write one packet. A write failure while a close is in flight is
    /// swallowed and reported as success: pending shutdown wins over
    /// reporting a write error.
    pub async fn pour(&self, pkt: &Packet) -> Result<(), TransportError> {
        let mut writer = self.inner.writer.lock().await;
        match writer.write_packet(pkt).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_closing() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close the transport. Only the first call acts: it wakes any
    /// blocked reader, sends a best-effort goodbye frame, and shuts the
    /// write half down.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self
            .inner
            .status
            .compare_exchange(
                Status::Open as u8,
                Status::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        self.inner.closing.notify_waiters();

        let result = {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.write_goodbye().await;
            writer.shutdown().await
        };
        self.inner.status.store(Status::Closed as u8, Ordering::Release);
        result
    }
}
