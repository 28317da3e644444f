//! Binary wire protocol between the pool coordinator and its executors.
//!
//! Every message is a 20-byte little-endian header followed by a typed
//! payload. The header carries a magic word, protocol version, message
//! type, flag bits, a per-message id, the payload length, a per-sender
//! monotonic sequence number, and a priority class.
//!
//! Encoding is deterministic and `decode(encode(m)) == m` holds for every
//! message kind; both directions validate magic, version, and length
//! before touching the payload.

mod codes;
mod error;
mod frame;
mod message;

pub use codes::{ErrorCategory, ErrorCode};
pub use error::WireError;
pub use frame::{FrameFlags, FrameHeader, MessageType, Priority, HEADER_LEN, MAGIC, MAX_PAYLOAD, VERSION};
pub use message::{
    BatchChunk, Body, Envelope, ErrorBody, HeartbeatStatus, HeartbeatSummary, TaskFailure,
    TaskReply, TaskSubmission,
};
