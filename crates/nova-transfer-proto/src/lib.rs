use serde::{Deserialize, Serialize};

/// Hard limit enforced when encoding or decoding a single stream message.
///
/// Chunk payloads are capped well below this by the server's configured chunk size; the limit
/// exists so an untrusted length prefix cannot trigger an outsized allocation.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Identifier chosen by the initiator of a transfer.
///
/// Unique among the transfers currently pending on one connection.
pub type CorrelationId = u32;

/// Per-transfer chunk sequence number, starting at 0.
pub type SeqNo = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Data,
    /// Final chunk of a transfer. May carry an empty payload.
    End,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub correlation_id: CorrelationId,
    pub seq_no: SeqNo,
    pub chunk_type: ChunkType,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Chunk {
    pub fn is_end(&self) -> bool {
        self.chunk_type == ChunkType::End
    }
}

/// Starts a client-to-server upload. `request` is decoded by the push handler's prototype.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushRequest {
    pub correlation_id: CorrelationId,
    pub request: Vec<u8>,
}

/// Starts a server-to-client download. `request` is decoded by the pull handler's prototype.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    pub correlation_id: CorrelationId,
    pub request: Vec<u8>,
}

/// Sent by the receiver of a pull to abandon it before the final chunk.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseNotification {
    pub correlation_id: CorrelationId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessage {
    PushRequest(PushRequest),
    PullRequest(PullRequest),
    Chunk(Chunk),
    CloseNotification(CloseNotification),
}

impl StreamMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            StreamMessage::PushRequest(msg) => msg.correlation_id,
            StreamMessage::PullRequest(msg) => msg.correlation_id,
            StreamMessage::Chunk(msg) => msg.correlation_id,
            StreamMessage::CloseNotification(msg) => msg.correlation_id,
        }
    }

    /// Stable name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::PushRequest(_) => "push_request",
            StreamMessage::PullRequest(_) => "pull_request",
            StreamMessage::Chunk(_) => "chunk",
            StreamMessage::CloseNotification(_) => "close_notification",
        }
    }
}

impl From<PushRequest> for StreamMessage {
    fn from(value: PushRequest) -> Self {
        StreamMessage::PushRequest(value)
    }
}

impl From<PullRequest> for StreamMessage {
    fn from(value: PullRequest) -> Self {
        StreamMessage::PullRequest(value)
    }
}

impl From<Chunk> for StreamMessage {
    fn from(value: Chunk) -> Self {
        StreamMessage::Chunk(value)
    }
}

impl From<CloseNotification> for StreamMessage {
    fn from(value: CloseNotification) -> Self {
        StreamMessage::CloseNotification(value)
    }
}

/// Length-prefixed bincode framing (`u32` little-endian length, then the encoded message).
pub mod codec;

/// Decoding of opaque request payloads into handler request types.
pub mod prototype;

pub use codec::{decode_message, encode_message, read_frame, write_frame, CodecError};
pub use prototype::{BincodePrototype, DecodeError, JsonPrototype, RequestPrototype};
