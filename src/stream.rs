// src/stream.rs
//! Per-request bidirectional stream.
//!
//! A [`Stream`] is one logical call's channel: inbound values arrive
//! through the request's pipe, outbound values and terminations go out
//! through the shared packet transport. The session and the caller (or
//! handler) hold clones of the same stream.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{Packet, PacketFlags, RequestId};
use crate::error::{CallError, RpcError};
use crate::packer::Packer;
use crate::pipe::PipeReceiver;

/// A decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyValue {
    /// JSON-flagged body.
    Json(serde_json::Value),
    /// STRING-flagged body.
    Text(String),
    /// Raw binary body.
    Blob(Bytes),
}

impl BodyValue {
    /// Decode into a concrete type. Text bodies decode as JSON strings;
    /// binary bodies are rejected.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        match self {
            BodyValue::Json(v) => Ok(serde_json::from_value(v)?),
            BodyValue::Text(s) => Ok(serde_json::from_value(serde_json::Value::String(s))?),
            BodyValue::Blob(_) => Err(RpcError::Protocol(
                "binary body where a JSON value was expected".into(),
            )),
        }
    }
}

struct StreamState {
    /// Bound late for outbound calls: the id is allocated under the
    /// session's table lock after the stream exists.
    id: Option<RequestId>,
    /// Whether the outgoing direction streams (controls the STREAM flag
    /// on poured values and whether `close` owes the peer an end packet).
    out_streams: bool,
    /// Set once we have sent our termination packet.
    ended: bool,
}

struct StreamInner {
    packer: Packer,
    rx: AsyncMutex<PipeReceiver<Packet>>,
    state: Mutex<StreamState>,
}

/// One logical call's bidirectional channel, bound to a request id.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Stream")
            .field("id", &state.id)
            .field("out_streams", &state.out_streams)
            .field("ended", &state.ended)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        packer: Packer,
        rx: PipeReceiver<Packet>,
        id: Option<RequestId>,
        out_streams: bool,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                packer,
                rx: AsyncMutex::new(rx),
                state: Mutex::new(StreamState {
                    id,
                    out_streams,
                    ended: false,
                }),
            }),
        }
    }

    pub(crate) fn bind_id(&self, id: RequestId) {
        self.inner.state.lock().id = Some(id);
    }

    /// The request id this stream is bound to, once known.
    pub fn id(&self) -> Option<RequestId> {
        self.inner.state.lock().id
    }

    /// Next inbound value. `Ok(None)` after the peer ended the call
    /// cleanly; the peer's error if it ended the call with one. Reading
    /// stays valid after [`close`](Self::close) — ending our outgoing
    /// direction does not end theirs.
    pub async fn next(&self) -> Result<Option<BodyValue>, RpcError> {
        let pkt = {
            let mut rx = self.inner.rx.lock().await;
            rx.next().await.map_err(RpcError::Remote)?
        };
        let Some(pkt) = pkt else {
            return Ok(None);
        };
        decode_body(&pkt).map(Some)
    }

    /// Next inbound value decoded into `T`.
    pub async fn next_as<T: DeserializeOwned>(&self) -> Result<Option<T>, RpcError> {
        match self.next().await? {
            Some(value) => value.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Send one value on this call.
    pub async fn pour(&self, value: &impl Serialize) -> Result<(), RpcError> {
        let (id, flags) = {
            let state = self.inner.state.lock();
            if state.ended {
                return Err(RpcError::StreamClosed);
            }
            let id = state.id.ok_or(RpcError::Unbound)?;
            let mut flags = PacketFlags::JSON;
            if state.out_streams {
                flags |= PacketFlags::STREAM;
            }
            (id, flags)
        };

        let body = serde_json::to_vec(value)?;
        let pkt = Packet {
            flags,
            id,
            body: Bytes::from(body),
        };
        self.inner.packer.pour(&pkt).await.map_err(RpcError::Transport)
    }

    /// End the outgoing direction cleanly. Sends one termination packet
    /// if this side streams and has not already ended; otherwise only
    /// marks the stream ended. Idempotent.
    pub async fn close(&self) -> Result<(), RpcError> {
        let end = {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Ok(());
            }
            state.ended = true;
            match (state.out_streams, state.id) {
                (true, Some(id)) => Some(id),
                _ => None,
            }
        };
        if let Some(id) = end {
            self.inner
                .packer
                .pour(&Packet::end_ok(id))
                .await
                .map_err(RpcError::Transport)?;
        }
        Ok(())
    }

    /// End the call with an error. Unlike [`close`](Self::close) this
    /// always notifies the peer, whichever directions stream. Idempotent
    /// with any earlier end.
    pub async fn close_with_error(&self, err: &CallError) -> Result<(), RpcError> {
        let id = {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Ok(());
            }
            state.ended = true;
            state.id.ok_or(RpcError::Unbound)?
        };
        self.inner
            .packer
            .pour(&Packet::end_err(id, err))
            .await
            .map_err(RpcError::Transport)
    }
}

fn decode_body(pkt: &Packet) -> Result<BodyValue, RpcError> {
    if pkt.flags.contains(PacketFlags::JSON) {
        Ok(BodyValue::Json(serde_json::from_slice(&pkt.body)?))
    } else if pkt.flags.contains(PacketFlags::STRING) {
        let text = std::str::from_utf8(&pkt.body)
            .map_err(|_| RpcError::Protocol("string body is not valid utf-8".into()))?;
        Ok(BodyValue::Text(text.to_owned()))
    } else {
        Ok(BodyValue::Blob(pkt.body.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use serde_json::json;

    fn wired(out_streams: bool) -> (Stream, crate::pipe::PipeSender<Packet>, Packer) {
        let (ours, theirs) = Packer::pair();
        let (tx, rx) = pipe(5);
        let stream = Stream::new(ours, rx, Some(RequestId::local(1)), out_streams);
        (stream, tx, theirs)
    }

    #[tokio::test]
    async fn pour_sets_stream_flag_when_streaming() {
        let (stream, _tx, peer) = wired(true);
        stream.pour(&json!(42)).await.unwrap();

        let pkt = peer.next().await.unwrap().unwrap();
        assert_eq!(pkt.flags, PacketFlags::JSON | PacketFlags::STREAM);
        assert_eq!(pkt.id, RequestId::remote(1));
        assert_eq!(pkt.body.as_ref(), b"42");
    }

    #[tokio::test]
    async fn pour_without_streaming_omits_stream_flag() {
        let (stream, _tx, peer) = wired(false);
        stream.pour(&json!("reply")).await.unwrap();

        let pkt = peer.next().await.unwrap().unwrap();
        assert_eq!(pkt.flags, PacketFlags::JSON);
    }

    #[tokio::test]
    async fn close_sends_one_end_packet_for_streaming_side() {
        let (stream, _tx, peer) = wired(true);
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        let pkt = peer.next().await.unwrap().unwrap();
        assert!(pkt.is_end_err());
        assert!(pkt.body_is_true());

        // The second close sent nothing.
        let silent =
            tokio::time::timeout(std::time::Duration::from_millis(20), peer.next()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn close_for_non_streaming_side_sends_nothing() {
        let (stream, _tx, peer) = wired(false);
        stream.close().await.unwrap();

        let silent =
            tokio::time::timeout(std::time::Duration::from_millis(20), peer.next()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn pour_after_close_fails() {
        let (stream, _tx, _peer) = wired(true);
        stream.close().await.unwrap();
        assert!(matches!(
            stream.pour(&json!(1)).await,
            Err(RpcError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn close_with_error_reaches_peer() {
        let (stream, _tx, peer) = wired(false);
        stream
            .close_with_error(&CallError::new("went wrong"))
            .await
            .unwrap();

        let pkt = peer.next().await.unwrap().unwrap();
        assert!(pkt.is_end_err());
        let err = CallError::parse(&pkt.body).unwrap();
        assert_eq!(err.message, "went wrong");
    }

    #[tokio::test]
    async fn next_decodes_bodies_by_flag() {
        let (stream, tx, _peer) = wired(false);

        tx.pour(Packet {
            flags: PacketFlags::JSON,
            id: RequestId::local(1),
            body: Bytes::from_static(b"[1,2]"),
        })
        .await
        .unwrap();
        tx.pour(Packet {
            flags: PacketFlags::STRING,
            id: RequestId::local(1),
            body: Bytes::from_static(b"hey"),
        })
        .await
        .unwrap();
        tx.pour(Packet {
            flags: PacketFlags::empty(),
            id: RequestId::local(1),
            body: Bytes::from_static(&[0xde, 0xad]),
        })
        .await
        .unwrap();
        tx.close();

        assert_eq!(
            stream.next().await.unwrap(),
            Some(BodyValue::Json(json!([1, 2])))
        );
        assert_eq!(
            stream.next().await.unwrap(),
            Some(BodyValue::Text("hey".into()))
        );
        assert_eq!(
            stream.next().await.unwrap(),
            Some(BodyValue::Blob(Bytes::from_static(&[0xde, 0xad])))
        );
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_error_surfaces_through_next() {
        let (stream, tx, _peer) = wired(false);
        tx.close_with_error(CallError::new("remote blew up"));

        match stream.next().await {
            Err(RpcError::Remote(e)) => assert_eq!(e.message, "remote blew up"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_as_decodes_typed_values() {
        let (stream, tx, _peer) = wired(false);
        tx.pour(Packet {
            flags: PacketFlags::JSON,
            id: RequestId::local(1),
            body: Bytes::from_static(b"\"typed\""),
        })
        .await
        .unwrap();
        tx.close();

        let value: Option<String> = stream.next_as().await.unwrap();
        assert_eq!(value.as_deref(), Some("typed"));
        let done: Option<String> = stream.next_as().await.unwrap();
        assert_eq!(done, None);
    }

    #[tokio::test]
    async fn unbound_stream_cannot_pour() {
        let (ours, _theirs) = Packer::pair();
        let (_tx, rx) = pipe(5);
        let stream = Stream::new(ours, rx, None, true);
        assert!(matches!(
            stream.pour(&json!(1)).await,
            Err(RpcError::Unbound)
        ));

        stream.bind_id(RequestId::local(4));
        stream.pour(&json!(1)).await.unwrap();
    }
}
