//! Protocol messages.
//!
//! The inner `data` payload of both [`Request`] and [`Reply`] is opaque to
//! the gateway: it is produced and consumed by the backend services and the
//! clients, and forwarded verbatim. Only the envelope fields are interpreted
//! here.

use std::time::SystemTime;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ProtoError;
use crate::pool::Poolable;

/// Reserved reply codes. Application reply codes are non-negative.
pub mod code {
    /// Reply carrying an [`RpcError`](super::RpcError) payload.
    pub const RPC_ERROR: i32 = -1;
}

/// A client request as carried on the wire.
///
/// `service_code` is the routing key; `method` names the gRPC method under
/// the service's path prefix. `node_id` is an optional routing hint for
/// stateful services with client allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen request identifier, echoed back on the reply
    pub id: u32,
    /// Target service code (non-zero for valid requests)
    pub service_code: i32,
    /// Method name, joined onto the service's gRPC path prefix
    pub method: String,
    /// Optional node hint; only honored for client-allocated stateful services
    pub node_id: Option<Ulid>,
    /// When set, the gateway does not send a reply for this request
    pub no_reply: bool,
    /// Declared by server-streaming clients; carried and logged, not dispatched
    pub server_stream: bool,
    /// Opaque marshalled inner message
    pub data: Vec<u8>,
}

impl Poolable for Request {
    fn reset(&mut self) {
        self.id = 0;
        self.service_code = 0;
        self.method.clear();
        self.node_id = None;
        self.no_reply = false;
        self.server_stream = false;
        self.data.clear();
    }
}

/// A reply as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Identifier of the request this reply answers; 0 for server pushes
    pub request_id: u32,
    /// Service code the reply originates from
    pub from_service: i32,
    /// Application reply code; negative codes are reserved (see [`code`])
    pub code: i32,
    /// Opaque marshalled inner message
    pub data: Vec<u8>,
}

impl Reply {
    /// Packs a serializable payload into a reply with the given code.
    pub fn with_payload<T: Serialize>(code: i32, payload: &T) -> Result<Self, ProtoError> {
        Ok(Self {
            request_id: 0,
            from_service: 0,
            code,
            data: postcard::to_allocvec(payload)?,
        })
    }

    /// Decodes the inner payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        Ok(postcard::from_bytes(&self.data)?)
    }
}

impl Poolable for Reply {
    fn reset(&mut self) {
        self.request_id = 0;
        self.from_service = 0;
        self.code = 0;
        self.data.clear();
    }
}

/// gRPC-style status carried back to clients inside an [`RpcError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
}

/// Payload of a [`code::RPC_ERROR`] reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Service code of the failed request
    pub request_service: i32,
    /// Method of the failed request
    pub request_method: String,
    /// The status the backend (or the gateway itself) produced
    pub status: RpcStatus,
}

/// Server-initiated fan-out message addressed by session ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multicast {
    /// Session ids the content should be delivered to
    pub receiver: Vec<String>,
    /// Publish time; receivers drop messages older than their staleness window
    pub time: SystemTime,
    /// The reply to push to each receiver
    pub content: Reply,
}

impl Multicast {
    /// Creates a multicast stamped with the current time.
    pub fn new(receiver: Vec<String>, content: Reply) -> Self {
        Self {
            receiver,
            time: SystemTime::now(),
            content,
        }
    }
}
