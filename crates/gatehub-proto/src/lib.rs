//! Wire protocol for gatehub.
//!
//! Everything that crosses a client connection lives here: the [`Request`]
//! and [`Reply`] messages, the [`Multicast`] push envelope, the
//! length-prefixed [frame codec](codec), the [object pool](pool) used by the
//! gateway's hot path, and the process-wide [reply-type registry](reply_types).
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length prefix followed by a
//! postcard-encoded message:
//!
//! ```text
//! [4-byte length] [payload]
//! ```
//!
//! A zero-length frame is a keepalive ping: it refreshes the session's
//! read/write clock and is never answered.

pub mod codec;
pub mod error;
pub mod message;
pub mod pool;
pub mod reply_types;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame, write_ping, Frame};
pub use error::ProtoError;
pub use message::{code, Multicast, Reply, Request, RpcError, RpcStatus};
pub use pool::{Pool, Poolable};
pub use reply_types::ReplyTypeRegistry;

/// Convenience result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
