// src/request.rs
//! One logical call's bookkeeping: its type, method path, arguments,
//! bound stream, and — on the handler side — the operations that
//! complete it.

use std::sync::Weak;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{PacketFlags, RequestId};
use crate::error::{CallError, RpcError};
use crate::pipe::PipeSender;
use crate::session::SessionInner;
use crate::stream::Stream;

/// Which directions of a call stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// One request value, one response value.
    Async,
    /// One request value, a stream of response values.
    Source,
    /// A stream of request values, no response.
    Sink,
    /// Streams in both directions.
    Duplex,
}

impl CallType {
    /// The flag the call type contributes to its opening packet.
    pub(crate) fn flags(self) -> PacketFlags {
        match self {
            CallType::Async => PacketFlags::empty(),
            CallType::Source | CallType::Sink | CallType::Duplex => PacketFlags::STREAM,
        }
    }

    /// Whether the caller's outgoing direction streams.
    pub(crate) fn caller_streams_out(self) -> bool {
        matches!(self, CallType::Sink | CallType::Duplex)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Async => "async",
            CallType::Source => "source",
            CallType::Sink => "sink",
            CallType::Duplex => "duplex",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method path: ordered segments, e.g. `["blobs", "get"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(pub Vec<String>);

impl Method {
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<Vec<String>> for Method {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<Vec<&str>> for Method {
    fn from(segments: Vec<&str>) -> Self {
        Self(segments.into_iter().map(str::to_owned).collect())
    }
}

impl From<&[&str]> for Method {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// The JSON body of a call's opening packet.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub name: Method,
    pub args: Vec<Value>,
}

/// One outstanding call, outbound or inbound.
///
/// Handlers receive a `Request` for every newly observed inbound call
/// and complete it through [`respond`](Self::respond),
/// [`finish`](Self::finish), or
/// [`finish_with_error`](Self::finish_with_error).
#[derive(Clone)]
pub struct Request {
    pub(crate) id: RequestId,
    pub(crate) call_type: CallType,
    pub(crate) method: Method,
    pub(crate) args: Vec<Value>,
    pub(crate) stream: Stream,
    pub(crate) producer: PipeSender<crate::codec::Packet>,
    pub(crate) session: Weak<SessionInner>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("call_type", &self.call_type)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The call's bidirectional stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Answer an async call: send the one response value, then finish.
    pub async fn respond(&self, value: &impl Serialize) -> Result<(), RpcError> {
        if self.call_type != CallType::Async {
            return Err(RpcError::Protocol(format!(
                "respond on a {} call",
                self.call_type
            )));
        }
        self.stream.pour(value).await?;
        self.finish().await
    }

    /// Acknowledge completion of this exchange: deregister the id and
    /// send the clean termination packet.
    pub async fn finish(&self) -> Result<(), RpcError> {
        let session = self.session.upgrade().ok_or(RpcError::SessionClosed)?;
        session.finish(self.id).await
    }

    /// End this exchange with an error: deregister the id and send the
    /// error termination packet.
    pub async fn finish_with_error(&self, err: &CallError) -> Result<(), RpcError> {
        let session = self.session.upgrade().ok_or(RpcError::SessionClosed)?;
        session.finish_with_error(self.id, err).await
    }
}
