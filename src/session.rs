// src/session.rs
//! Session multiplexer.
//!
//! One [`Session`] coordinates many concurrent logical calls over a
//! single [`Packer`]: it allocates request ids, routes every inbound
//! packet to the right call, spawns handler tasks for calls the peer
//! initiates, and implements clean and error termination per call.
//!
//! Exactly one task runs [`Session::serve`]; it processes inbound
//! packets in strict arrival order, which preserves ordering between
//! data and termination for any given id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{Packet, PacketFlags, RequestId};
use crate::error::{CallError, RpcError};
use crate::packer::Packer;
use crate::pipe::{PipeClosed, pipe};
use crate::request::{CallType, Envelope, Method, Request};
use crate::stream::Stream;

/// Default buffered capacity of each request's inbound pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 5;

/// Default window for delivering one inbound packet to a request's pipe.
pub const DEFAULT_DELIVER_TIMEOUT: Duration = Duration::from_millis(1);

/// Tuning knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the dispatch loop waits to hand an inbound packet to a
    /// request's pipe. Exceeding it fails the whole session: the policy
    /// prefers whole-session failure over unbounded buffering or silent
    /// drops. Raise `pipe_capacity` to absorb bursts instead.
    pub deliver_timeout: Duration,

    /// Buffered capacity of each request's inbound pipe.
    pub pipe_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deliver_timeout: DEFAULT_DELIVER_TIMEOUT,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Reacts to session establishment and to calls the peer initiates.
///
/// Both hooks run on their own spawned tasks, concurrent with the
/// dispatch loop, with each other, and with local outbound calls. The
/// returned futures must not borrow `self`; clone what they need.
pub trait Handler: Send + Sync + 'static {
    /// Called once when the session is set up.
    fn handle_connect(&self, session: Session) -> BoxFuture<'static, ()>;

    /// Called once per newly observed inbound call.
    fn handle_call(&self, request: Request) -> BoxFuture<'static, ()>;
}

#[derive(Default)]
struct RequestTable {
    /// Highest locally allocated id. Strictly increasing, never reused
    /// while the session lives.
    highest: u32,
    entries: HashMap<RequestId, Request>,
}

pub(crate) struct SessionInner {
    packer: Packer,
    /// Request table and id counter under one lock: allocation is
    /// atomic with insertion.
    table: Mutex<RequestTable>,
    /// Termination flag under its own lock, so closing never contends
    /// with table work.
    terminated: Mutex<bool>,
    handler: Arc<dyn Handler>,
    config: SessionConfig,
}

impl SessionInner {
    /// Deregister `id` and send the clean termination packet.
    pub(crate) async fn finish(&self, id: RequestId) -> Result<(), RpcError> {
        self.table.lock().entries.remove(&id);
        self.packer
            .pour(&Packet::end_ok(id))
            .await
            .map_err(RpcError::Transport)
    }

    /// Deregister `id` and send the error termination packet.
    pub(crate) async fn finish_with_error(
        &self,
        id: RequestId,
        err: &CallError,
    ) -> Result<(), RpcError> {
        self.table.lock().entries.remove(&id);
        self.packer
            .pour(&Packet::end_err(id, err))
            .await
            .map_err(RpcError::Transport)
    }
}

/// The multiplexed connection-level coordinator for many logical calls.
///
/// Cheap to clone; clones share one underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("requests", &self.inner.table.lock().entries.len())
            .field("terminated", &*self.inner.terminated.lock())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Set up a session over `packer` with the default configuration.
    ///
    /// Spawns `handler.handle_connect` on its own task, so this must be
    /// called within a tokio runtime. The session does nothing further
    /// until some task runs [`serve`](Self::serve).
    pub fn new(packer: Packer, handler: impl Handler) -> Self {
        Self::with_config(packer, handler, SessionConfig::default())
    }

    /// Set up a session with explicit tuning.
    pub fn with_config(packer: Packer, handler: impl Handler, config: SessionConfig) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                packer,
                table: Mutex::new(RequestTable::default()),
                terminated: Mutex::new(false),
                handler: Arc::new(handler),
                config,
            }),
        };
        let connect = session.inner.handler.handle_connect(session.clone());
        tokio::spawn(connect);
        session
    }

    /// Request/response: send one value, await the one response value.
    pub async fn call_async<T: serde::de::DeserializeOwned>(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let req = self.do_call(CallType::Async, method.into(), args).await?;
        match req.stream().next().await? {
            Some(value) => value.decode(),
            None => Err(RpcError::UnexpectedEnd),
        }
    }

    /// Server-streaming: the returned stream yields the peer's values.
    pub async fn source(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<Stream, RpcError> {
        let req = self.do_call(CallType::Source, method.into(), args).await?;
        Ok(req.stream)
    }

    /// Client-streaming: pour values into the returned stream, then
    /// close it.
    pub async fn sink(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<Stream, RpcError> {
        let req = self.do_call(CallType::Sink, method.into(), args).await?;
        Ok(req.stream)
    }

    /// Bidirectional-streaming: the returned stream carries both
    /// directions.
    pub async fn duplex(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<Stream, RpcError> {
        let req = self.do_call(CallType::Duplex, method.into(), args).await?;
        Ok(req.stream)
    }

    /// End the session: raise the termination flag and close the
    /// transport. A concurrently blocked [`serve`](Self::serve) then
    /// returns gracefully rather than with an error.
    pub async fn terminate(&self) -> Result<(), RpcError> {
        *self.inner.terminated.lock() = true;
        self.inner.packer.close().await.map_err(RpcError::Transport)
    }

    fn terminated(&self) -> bool {
        *self.inner.terminated.lock()
    }

    /// Issue an outbound call: register it, then send its opening
    /// packet.
    ///
    /// The table entry is inserted (and the id consumed) before the
    /// send; a send failure is returned without rolling either back, so
    /// a failed call permanently uses up its id.
    async fn do_call(
        &self,
        call_type: CallType,
        method: Method,
        args: Vec<Value>,
    ) -> Result<Request, RpcError> {
        let body = serde_json::to_vec(&Envelope {
            call_type,
            name: method.clone(),
            args: args.clone(),
        })?;

        let (producer, consumer) = pipe(self.inner.config.pipe_capacity);
        let stream = Stream::new(
            self.inner.packer.clone(),
            consumer,
            None,
            call_type.caller_streams_out(),
        );

        let req = {
            let mut table = self.inner.table.lock();
            table.highest += 1;
            let id = RequestId::local(table.highest);
            let req = Request {
                id,
                call_type,
                method,
                args,
                stream: stream.clone(),
                producer,
                session: Arc::downgrade(&self.inner),
            };
            table.entries.insert(id, req.clone());
            stream.bind_id(id);
            req
        };

        let pkt = Packet {
            flags: PacketFlags::JSON | call_type.flags(),
            id: req.id,
            body: body.into(),
        };
        self.inner.packer.pour(&pkt).await?;
        Ok(req)
    }

    /// Parse the opening packet of a call the peer initiated.
    ///
    /// Only valid for ids not yet in the table: the packet must carry
    /// the JSON flag and a peer-allocated id; anything else is a
    /// protocol violation.
    fn parse_request(&self, pkt: &Packet) -> Result<Request, RpcError> {
        if !pkt.flags.contains(PacketFlags::JSON) {
            return Err(RpcError::Protocol("call packet without json flag".into()));
        }
        if pkt.id.origin != crate::codec::Origin::Remote {
            return Err(RpcError::Protocol(format!(
                "unseen request id {} belongs to our own namespace",
                pkt.id
            )));
        }

        let env: Envelope = serde_json::from_slice(&pkt.body)?;

        // Our outgoing direction, seen from the callee side.
        let out_streams = if pkt.flags.contains(PacketFlags::STREAM) {
            match env.call_type {
                CallType::Duplex | CallType::Source => true,
                CallType::Sink => false,
                CallType::Async => {
                    return Err(RpcError::Protocol("stream flag on async call".into()));
                }
            }
        } else {
            false
        };

        let (producer, consumer) = pipe(self.inner.config.pipe_capacity);
        let stream = Stream::new(
            self.inner.packer.clone(),
            consumer,
            Some(pkt.id),
            out_streams,
        );

        Ok(Request {
            id: pkt.id,
            call_type: env.call_type,
            method: env.name,
            args: env.args,
            stream,
            producer,
            session: Arc::downgrade(&self.inner),
        })
    }

    /// Look up the request for `pkt.id`, or register a new one and hand
    /// it to the handler on an independent task. The boolean reports a
    /// first sighting.
    fn fetch_request(&self, pkt: &Packet) -> Result<(Request, bool), RpcError> {
        let mut table = self.inner.table.lock();
        if let Some(req) = table.entries.get(&pkt.id) {
            return Ok((req.clone(), false));
        }

        let req = self.parse_request(pkt)?;
        table.entries.insert(pkt.id, req.clone());

        tracing::debug!("inbound {} call {} on {}", req.call_type, req.method, req.id);
        let call = self.inner.handler.handle_call(req.clone());
        tokio::spawn(call);

        Ok((req, true))
    }

    /// Process a termination packet. Unknown ids are ignored — a late or
    /// duplicate termination is not an error.
    async fn handle_termination(&self, pkt: &Packet) -> Result<(), RpcError> {
        let req = self.inner.table.lock().entries.remove(&pkt.id);
        let Some(req) = req else {
            tracing::trace!("termination for unknown id {}", pkt.id);
            return Ok(());
        };

        if pkt.body_is_true() {
            req.producer.close();
            req.stream.close().await?;
        } else {
            let err = CallError::parse(&pkt.body)?;
            req.producer.close_with_error(err);
        }
        Ok(())
    }

    /// Drive the session: read every inbound packet and route it.
    ///
    /// Run exactly one `serve` per session. Its return value is the only
    /// signal of session end and its cause: `Ok(())` after the peer
    /// closed or [`terminate`](Self::terminate) was called, an error if
    /// the session died. Once it returns, the session is unusable.
    pub async fn serve(&self) -> Result<(), RpcError> {
        loop {
            let pkt = match self.inner.packer.next().await {
                Ok(Some(pkt)) => pkt,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if self.terminated() {
                        return Ok(());
                    }
                    tracing::error!("session read failed: {e}");
                    return Err(RpcError::Transport(e));
                }
            };

            if pkt.is_end_err() {
                self.handle_termination(&pkt).await?;
                continue;
            }

            let (req, first_sighting) = match self.fetch_request(&pkt) {
                Ok(found) => found,
                Err(e) => {
                    // A malformed call only fails its own construction.
                    tracing::warn!("dropping unroutable packet for {}: {e}", pkt.id);
                    continue;
                }
            };
            if first_sighting {
                // The opening packet is consumed by parsing.
                continue;
            }

            let id = req.id;
            let window = self.inner.config.deliver_timeout;
            match tokio::time::timeout(window, req.producer.pour(pkt)).await {
                Ok(Ok(())) => {}
                Ok(Err(PipeClosed)) => {
                    tracing::error!("request {id} pipe closed during delivery");
                    return Err(RpcError::PipeClosed);
                }
                Err(_) => {
                    tracing::error!("inbound delivery for {id} exceeded {window:?}");
                    return Err(RpcError::DeliveryTimeout(window));
                }
            }
        }
    }
}
