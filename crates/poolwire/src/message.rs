use crate::{ErrorCode, FrameFlags, FrameHeader, MessageType, Priority, WireError, MAX_PAYLOAD};

/// A task dispatched to an executor.
///
/// `method` is either a registered handler name or an opaque serialized
/// function body; the codec does not distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSubmission {
    pub method: String,
    pub params: Vec<u8>,
}

/// A successful task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReply {
    pub result: Vec<u8>,
}

/// Structured error body carried inside a `TaskError` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub stack: String,
}

/// A failed task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub error: ErrorBody,
}

/// Executor health status byte in a heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeartbeatStatus {
    Healthy = 0,
    Degraded = 1,
    Draining = 2,
}

impl TryFrom<u8> for HeartbeatStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Healthy,
            1 => Self::Degraded,
            2 => Self::Draining,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Heartbeat response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub status: HeartbeatStatus,
    pub task_count: u32,
    pub memory_bytes: u64,
    pub uptime_ms: u64,
}

/// One chunk of a serialized batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchChunk {
    pub batch_id: String,
    pub task_count: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
    /// Concatenated task submissions, each encoded as its own payload.
    pub tasks: Vec<u8>,
}

/// Typed message body, one variant per wire message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    TaskRequest(TaskSubmission),
    TaskResponse(TaskReply),
    TaskError(TaskFailure),
    /// Opaque structured event bytes (the host defines the encoding).
    Event(Vec<u8>),
    HeartbeatReq,
    HeartbeatRes(HeartbeatSummary),
    CleanupReq,
    /// Whether the executor finished draining in time.
    CleanupRes { drained: bool },
    Terminate,
    Batch(BatchChunk),
    StreamChunk(Vec<u8>),
}

impl Body {
    /// The wire message type this body encodes as.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TaskRequest(_) => MessageType::TaskRequest,
            Self::TaskResponse(_) => MessageType::TaskResponse,
            Self::TaskError(_) => MessageType::TaskError,
            Self::Event(_) => MessageType::Event,
            Self::HeartbeatReq => MessageType::HeartbeatReq,
            Self::HeartbeatRes(_) => MessageType::HeartbeatRes,
            Self::CleanupReq => MessageType::CleanupReq,
            Self::CleanupRes { .. } => MessageType::CleanupRes,
            Self::Terminate => MessageType::Terminate,
            Self::Batch(_) => MessageType::Batch,
            Self::StreamChunk(_) => MessageType::StreamChunk,
        }
    }
}

/// A complete wire message: header metadata plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u32,
    pub sequence: u32,
    pub priority: Priority,
    pub flags: FrameFlags,
    pub body: Body,
}

impl Envelope {
    /// Convenience constructor with default flags.
    pub fn new(id: u32, sequence: u32, priority: Priority, body: Body) -> Self {
        Self {
            id,
            sequence,
            priority,
            flags: FrameFlags::default(),
            body,
        }
    }

    /// Serializes the message: header then payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = encode_body(&self.body);
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let header = FrameHeader {
            kind: self.body.message_type(),
            flags: self.flags,
            id: self.id,
            payload_length: payload.len() as u32,
            sequence: self.sequence,
            priority: self.priority,
        };

        let mut buf = Vec::with_capacity(crate::HEADER_LEN + payload.len());
        header.encode_into(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Parses a complete message from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::decode(bytes)?;
        let total = crate::HEADER_LEN + header.payload_length as usize;
        if bytes.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }

        let payload = &bytes[crate::HEADER_LEN..total];
        let mut reader = Reader::new(payload);
        let body = decode_body(header.kind, &mut reader)?;
        reader.finish()?;

        Ok(Self {
            id: header.id,
            sequence: header.sequence,
            priority: header.priority,
            flags: header.flags,
            body,
        })
    }
}

// -----------------------------------------------------------------------------
// Payload encoding
// -----------------------------------------------------------------------------

fn encode_body(body: &Body) -> Vec<u8> {
    let mut buf = Vec::new();
    match body {
        Body::TaskRequest(task) => {
            put_str16(&mut buf, &task.method);
            put_bytes32(&mut buf, &task.params);
        }
        Body::TaskResponse(reply) => {
            buf.push(1);
            put_bytes32(&mut buf, &reply.result);
        }
        Body::TaskError(failure) => {
            buf.push(0);
            let mut error = Vec::new();
            error.extend_from_slice(&failure.error.code.0.to_le_bytes());
            put_str16(&mut error, &failure.error.message);
            put_str16(&mut error, &failure.error.stack);
            put_bytes32(&mut buf, &error);
        }
        Body::Event(bytes) | Body::StreamChunk(bytes) => {
            buf.extend_from_slice(bytes);
        }
        Body::HeartbeatReq | Body::CleanupReq | Body::Terminate => {}
        Body::HeartbeatRes(summary) => {
            buf.push(summary.status as u8);
            buf.extend_from_slice(&summary.task_count.to_le_bytes());
            buf.extend_from_slice(&summary.memory_bytes.to_le_bytes());
            buf.extend_from_slice(&summary.uptime_ms.to_le_bytes());
        }
        Body::CleanupRes { drained } => {
            buf.push(u8::from(*drained));
        }
        Body::Batch(chunk) => {
            put_str16(&mut buf, &chunk.batch_id);
            buf.extend_from_slice(&chunk.task_count.to_le_bytes());
            buf.extend_from_slice(&chunk.chunk_index.to_le_bytes());
            buf.extend_from_slice(&chunk.total_chunks.to_le_bytes());
            buf.extend_from_slice(&chunk.tasks);
        }
    }
    buf
}

fn decode_body(kind: MessageType, reader: &mut Reader<'_>) -> Result<Body, WireError> {
    Ok(match kind {
        MessageType::TaskRequest => Body::TaskRequest(TaskSubmission {
            method: reader.str16("method")?,
            params: reader.bytes32()?,
        }),
        MessageType::TaskResponse | MessageType::TaskError => {
            let success = reader.u8()? != 0;
            let result = reader.bytes32()?;
            if success {
                Body::TaskResponse(TaskReply { result })
            } else {
                let mut inner = Reader::new(&result);
                let code = ErrorCode(inner.u16()?);
                let message = inner.str16("error message")?;
                let stack = inner.str16("error stack")?;
                inner.finish()?;
                Body::TaskError(TaskFailure {
                    error: ErrorBody {
                        code,
                        message,
                        stack,
                    },
                })
            }
        }
        MessageType::Event => Body::Event(reader.rest()),
        MessageType::HeartbeatReq => Body::HeartbeatReq,
        MessageType::HeartbeatRes => Body::HeartbeatRes(HeartbeatSummary {
            status: HeartbeatStatus::try_from(reader.u8()?)?,
            task_count: reader.u32()?,
            memory_bytes: reader.u64()?,
            uptime_ms: reader.u64()?,
        }),
        MessageType::CleanupReq => Body::CleanupReq,
        MessageType::CleanupRes => Body::CleanupRes {
            drained: reader.u8()? != 0,
        },
        MessageType::Terminate => Body::Terminate,
        MessageType::Batch => Body::Batch(BatchChunk {
            batch_id: reader.str16("batch id")?,
            task_count: reader.u32()?,
            chunk_index: reader.u16()?,
            total_chunks: reader.u16()?,
            tasks: reader.rest(),
        }),
        MessageType::StreamChunk => Body::StreamChunk(reader.rest()),
    })
}

fn put_str16(buf: &mut Vec<u8>, value: &str) {
    debug_assert!(value.len() <= u16::MAX as usize, "string field too long");
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_bytes32(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

/// Little-endian cursor over a payload slice.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.bytes.len() - self.offset < n {
            return Err(WireError::Truncated {
                needed: self.offset + n,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str16(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8 { field })
    }

    fn bytes32(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> Vec<u8> {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice.to_vec()
    }

    fn finish(&self) -> Result<(), WireError> {
        let remaining = self.bytes.len() - self.offset;
        if remaining != 0 {
            return Err(WireError::TrailingBytes(remaining));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: Body) {
        let envelope = Envelope::new(42, 9, Priority::Normal, body);
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        // Encoding is deterministic.
        assert_eq!(envelope.encode().unwrap(), encoded);
    }

    #[test]
    fn round_trips_every_message_kind() {
        round_trip(Body::TaskRequest(TaskSubmission {
            method: "compute".into(),
            params: vec![1, 2, 3],
        }));
        round_trip(Body::TaskResponse(TaskReply {
            result: vec![0xAA; 100],
        }));
        round_trip(Body::TaskError(TaskFailure {
            error: ErrorBody {
                code: ErrorCode::EXECUTION_FAILED,
                message: "boom".into(),
                stack: "at task.rs:1".into(),
            },
        }));
        round_trip(Body::Event(b"{\"kind\":\"scaled\"}".to_vec()));
        round_trip(Body::HeartbeatReq);
        round_trip(Body::HeartbeatRes(HeartbeatSummary {
            status: HeartbeatStatus::Healthy,
            task_count: 3,
            memory_bytes: 1 << 30,
            uptime_ms: 12_345,
        }));
        round_trip(Body::CleanupReq);
        round_trip(Body::CleanupRes { drained: true });
        round_trip(Body::Terminate);
        round_trip(Body::Batch(BatchChunk {
            batch_id: "batch-7".into(),
            task_count: 2,
            chunk_index: 0,
            total_chunks: 1,
            tasks: vec![9, 9, 9],
        }));
        round_trip(Body::StreamChunk(vec![5; 64]));
    }

    #[test]
    fn task_request_identity_literal() {
        // TaskRequest{id=42, method="compute", params=[1,2,3], priority=high}
        let envelope = Envelope::new(
            42,
            0,
            Priority::High,
            Body::TaskRequest(TaskSubmission {
                method: "compute".into(),
                params: vec![1, 2, 3],
            }),
        );
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.priority, Priority::High);
        match decoded.body {
            Body::TaskRequest(task) => {
                assert_eq!(task.method, "compute");
                assert_eq!(task.params, vec![1, 2, 3]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn error_payload_layout() {
        let envelope = Envelope::new(
            1,
            1,
            Priority::Normal,
            Body::TaskError(TaskFailure {
                error: ErrorBody {
                    code: ErrorCode::TIMEOUT,
                    message: "m".into(),
                    stack: String::new(),
                },
            }),
        );
        let bytes = envelope.encode().unwrap();
        let payload = &bytes[crate::HEADER_LEN..];
        assert_eq!(payload[0], 0); // success = false
        // Inner error body: code | message_len | message | stack_len
        let inner = &payload[5..];
        assert_eq!(u16::from_le_bytes([inner[0], inner[1]]), 3005);
        assert_eq!(u16::from_le_bytes([inner[2], inner[3]]), 1);
        assert_eq!(inner[4], b'm');
        assert_eq!(u16::from_le_bytes([inner[5], inner[6]]), 0);
    }

    #[test]
    fn truncated_payload_rejected() {
        let envelope = Envelope::new(
            1,
            1,
            Priority::Normal,
            Body::TaskRequest(TaskSubmission {
                method: "m".into(),
                params: vec![1, 2, 3, 4],
            }),
        );
        let bytes = envelope.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 2]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let envelope = Envelope::new(3, 3, Priority::Low, Body::HeartbeatReq);
        let mut bytes = envelope.encode().unwrap();
        // Grow the payload without updating the typed body.
        bytes.extend_from_slice(&[1, 2]);
        bytes[10..14].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(WireError::TrailingBytes(2))
        ));
    }
}
