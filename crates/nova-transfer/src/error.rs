use nova_transfer_proto::{CodecError, CorrelationId, DecodeError};

use crate::state::TransferKind;

/// A second transfer was registered under an id that is still pending.
///
/// Correlation ids are chosen by the peer; reusing one before the previous transfer is removed is
/// a protocol violation, not something the server can recover from.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("correlation id {correlation_id} is already registered as a pending transfer")]
pub struct DuplicateCorrelationId {
    pub correlation_id: CorrelationId,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failure of an outbound chunk write.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The receiver abandoned the transfer or the connection was torn down.
    #[error("transfer {correlation_id} was cancelled")]
    Cancelled { correlation_id: CorrelationId },

    #[error("transfer {correlation_id} already sent its final chunk")]
    AlreadyFinished { correlation_id: CorrelationId },

    #[error("failed to send chunk for transfer {correlation_id}: {source}")]
    Channel {
        correlation_id: CorrelationId,
        #[source]
        source: ChannelError,
    },
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("connection has not been opened")]
    NotOpen,

    #[error("connection is already open")]
    AlreadyOpen,

    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    DuplicateCorrelationId(#[from] DuplicateCorrelationId),

    /// The request payload could not be decoded. The connection has been closed.
    #[error("invalid {kind} request for transfer {correlation_id}: {source}")]
    InvalidRequest {
        kind: TransferKind,
        correlation_id: CorrelationId,
        #[source]
        source: DecodeError,
    },

    /// A message addressed a transfer of the other kind. Indicates a dispatch bug on the peer.
    #[error("transfer {correlation_id} is a {actual} transfer, expected {expected}")]
    UnexpectedTransferKind {
        correlation_id: CorrelationId,
        expected: TransferKind,
        actual: TransferKind,
    },

    #[error("push handler failed for transfer {correlation_id}: {source}")]
    PushHandler {
        correlation_id: CorrelationId,
        #[source]
        source: anyhow::Error,
    },
}
