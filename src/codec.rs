// src/codec.rs
//! Byte-level packet framing.
//!
//! Every packet travels as a 9-byte header — flag byte, body length
//! (`u32` big-endian), request id (`i32` big-endian) — followed by the
//! body. An all-zero header is the *goodbye* frame and ends the stream.
//!
//! The signed wire id is confined to this module: everywhere else a
//! request id is the tagged [`RequestId`], which records which peer's
//! namespace the number belongs to.

use bitflags::bitflags;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CallError, TransportError};

bitflags! {
    /// The packet flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// Body is UTF-8 text.
        const STRING  = 0b0001;
        /// Body is JSON.
        const JSON    = 0b0010;
        /// Termination packet: body is `true` (clean end) or an error value.
        const END_ERR = 0b0100;
        /// Packet belongs to a streaming exchange.
        const STREAM  = 0b1000;
    }
}

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 9;

/// Default cap on a single packet body (16 MiB).
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Which peer's id namespace a request number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Allocated by this session.
    Local,
    /// Allocated by the peer.
    Remote,
}

/// A request id tagged with its originating peer.
///
/// Both peers allocate from the same increasing positive integer space;
/// the sign of the wire form disambiguates. `Local n` is sent as `+n`,
/// `Remote n` as `-n`. On receipt the sign is flipped once, so a packet
/// answering one of our calls comes back as `Local` and a packet
/// introducing a peer-initiated call comes in as `Remote`. Those two
/// rules live in [`RequestId::to_wire`] and [`RequestId::from_wire`] and
/// nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub origin: Origin,
    pub value: u32,
}

impl RequestId {
    pub fn local(value: u32) -> Self {
        Self { origin: Origin::Local, value }
    }

    pub fn remote(value: u32) -> Self {
        Self { origin: Origin::Remote, value }
    }

    /// Encode for sending.
    pub(crate) fn to_wire(self) -> i32 {
        match self.origin {
            Origin::Local => self.value as i32,
            Origin::Remote => -(self.value as i32),
        }
    }

    /// Decode a received wire id, folding in the receive-time sign flip:
    /// a positive number was allocated by the peer, a negative one is a
    /// reply into our own namespace.
    pub(crate) fn from_wire(raw: i32) -> Result<Self, TransportError> {
        if raw > 0 {
            Ok(Self::remote(raw as u32))
        } else if raw < 0 {
            Ok(Self::local(raw.unsigned_abs()))
        } else {
            Err(TransportError::Decode("request id is zero".into()))
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.origin {
            Origin::Local => write!(f, "local:{}", self.value),
            Origin::Remote => write!(f, "remote:{}", self.value),
        }
    }
}

/// One framed wire unit: flags, tagged request id, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: PacketFlags,
    pub id: RequestId,
    pub body: Bytes,
}

impl Packet {
    /// A clean termination packet for `id` (body `true`).
    pub fn end_ok(id: RequestId) -> Self {
        Self {
            flags: PacketFlags::JSON | PacketFlags::END_ERR | PacketFlags::STREAM,
            id,
            body: Bytes::from_static(b"true"),
        }
    }

    /// An error termination packet for `id`.
    pub fn end_err(id: RequestId, err: &CallError) -> Self {
        let body = serde_json::to_vec(err).expect("error value serializes");
        Self {
            flags: PacketFlags::JSON | PacketFlags::END_ERR | PacketFlags::STREAM,
            id,
            body: Bytes::from(body),
        }
    }

    pub fn is_end_err(&self) -> bool {
        self.flags.contains(PacketFlags::END_ERR)
    }

    /// Whether the body is the literal JSON `true`, the clean-end marker.
    pub fn body_is_true(&self) -> bool {
        self.body.as_ref() == b"true"
    }
}

/// Decodes packets from the read half of a connection.
pub struct PacketReader<R> {
    inner: R,
    max_body_len: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_body_len(inner, DEFAULT_MAX_BODY_LEN)
    }

    pub fn with_max_body_len(inner: R, max_body_len: usize) -> Self {
        Self { inner, max_body_len }
    }

    /// Read one packet. `Ok(None)` on clean end of stream: EOF at a
    /// header boundary, or a goodbye frame. EOF inside a header or body
    /// is a decode error.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, TransportError> {
        let mut header = [0u8; HEADER_LEN];

        // Read the first byte separately so a clean close is
        // distinguishable from a truncated header.
        match self.inner.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
        self.inner
            .read_exact(&mut header[1..])
            .await
            .map_err(|e| truncated(e, "header"))?;

        if header == [0u8; HEADER_LEN] {
            // Goodbye frame.
            return Ok(None);
        }

        let flags = PacketFlags::from_bits(header[0]).ok_or_else(|| {
            TransportError::Decode(format!("unknown flag bits {:#010b}", header[0]))
        })?;
        let body_len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let raw_id = i32::from_be_bytes(header[5..9].try_into().unwrap());

        if body_len > self.max_body_len {
            return Err(TransportError::BodyTooLarge {
                len: body_len,
                max: self.max_body_len,
            });
        }
        let id = RequestId::from_wire(raw_id)?;

        let mut body = vec![0u8; body_len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| truncated(e, "body"))?;

        Ok(Some(Packet {
            flags,
            id,
            body: Bytes::from(body),
        }))
    }
}

fn truncated(e: std::io::Error, what: &str) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Decode(format!("stream ended inside packet {what}"))
    } else {
        TransportError::Io(e)
    }
}

/// Encodes packets onto the write half of a connection.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_packet(&mut self, pkt: &Packet) -> Result<(), TransportError> {
        let mut header = [0u8; HEADER_LEN];
        header[0] = pkt.flags.bits();
        header[1..5].copy_from_slice(&(pkt.body.len() as u32).to_be_bytes());
        header[5..9].copy_from_slice(&pkt.id.to_wire().to_be_bytes());

        self.inner.write_all(&header).await?;
        if !pkt.body.is_empty() {
            self.inner.write_all(&pkt.body).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Write the goodbye frame: an all-zero header.
    pub async fn write_goodbye(&mut self) -> Result<(), TransportError> {
        self.inner.write_all(&[0u8; HEADER_LEN]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            flags: PacketFlags::JSON | PacketFlags::STREAM,
            id: RequestId::local(7),
            body: Bytes::from_static(br#"{"x":1}"#),
        }
    }

    #[tokio::test]
    async fn packet_round_trip() {
        let mut buf = Vec::new();
        PacketWriter::new(&mut buf).write_packet(&sample()).await.unwrap();

        let mut reader = PacketReader::new(buf.as_slice());
        let pkt = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(pkt.flags, PacketFlags::JSON | PacketFlags::STREAM);
        // A local id comes back tagged remote: the decoder folds in the
        // receive-time flip, so the peer sees our allocation as theirs.
        assert_eq!(pkt.id, RequestId::remote(7));
        assert_eq!(pkt.body.as_ref(), br#"{"x":1}"#);
    }

    #[tokio::test]
    async fn reply_id_round_trip() {
        // The peer answers one of our calls with a Remote-tagged id;
        // decoding on our side restores Local.
        let reply = Packet {
            flags: PacketFlags::JSON,
            id: RequestId::remote(3),
            body: Bytes::from_static(b"1"),
        };
        let mut buf = Vec::new();
        PacketWriter::new(&mut buf).write_packet(&reply).await.unwrap();
        let pkt = PacketReader::new(buf.as_slice())
            .read_packet()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.id, RequestId::local(3));
    }

    #[tokio::test]
    async fn eof_at_boundary_is_end_of_stream() {
        let mut reader = PacketReader::new(&[][..]);
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn goodbye_is_end_of_stream() {
        let mut buf = Vec::new();
        PacketWriter::new(&mut buf).write_goodbye().await.unwrap();
        let mut reader = PacketReader::new(buf.as_slice());
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut reader = PacketReader::new(&[0x02, 0x00][..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        PacketWriter::new(&mut buf).write_packet(&sample()).await.unwrap();
        buf.truncate(HEADER_LEN + 2);
        let mut reader = PacketReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let mut buf = Vec::new();
        PacketWriter::new(&mut buf).write_packet(&sample()).await.unwrap();
        let mut reader = PacketReader::with_max_body_len(buf.as_slice(), 3);
        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::BodyTooLarge { len: 7, max: 3 })
        ));
    }

    #[tokio::test]
    async fn zero_id_rejected() {
        // Non-zero flags, zero id: not a goodbye, not a valid packet.
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = PacketFlags::JSON.bits();
        let mut reader = PacketReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn wire_sign_convention() {
        assert_eq!(RequestId::local(5).to_wire(), 5);
        assert_eq!(RequestId::remote(5).to_wire(), -5);
        assert_eq!(RequestId::from_wire(5).unwrap(), RequestId::remote(5));
        assert_eq!(RequestId::from_wire(-5).unwrap(), RequestId::local(5));
        assert!(RequestId::from_wire(0).is_err());
    }

    #[test]
    fn end_packets() {
        let ok = Packet::end_ok(RequestId::remote(2));
        assert!(ok.is_end_err());
        assert!(ok.body_is_true());

        let err = Packet::end_err(RequestId::remote(2), &CallError::new("nope"));
        assert!(err.is_end_err());
        assert!(!err.body_is_true());
        let parsed = CallError::parse(&err.body).unwrap();
        assert_eq!(parsed.message, "nope");
    }
}
