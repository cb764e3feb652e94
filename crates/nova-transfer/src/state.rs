use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use nova_transfer_proto::CorrelationId;

use crate::{PushIn, TransferOut};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Push,
    Pull,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Push => "push",
            TransferKind::Pull => "pull",
        })
    }
}

/// Server-to-client transfer driven by a pull worker.
#[derive(Debug)]
pub struct PullTransfer<E> {
    pub started_at: SystemTime,
    pub request: Arc<E>,
    pub out: Arc<TransferOut>,
}

/// Client-to-server transfer fed by inbound chunks.
#[derive(Debug)]
pub struct PushTransfer<F> {
    pub started_at: SystemTime,
    pub request: Arc<F>,
    pub push_in: Arc<PushIn>,
}

/// A pending transfer as stored in the registry.
///
/// `E` is the pull handler's request type and `F` the push handler's.
#[derive(Debug)]
pub enum TransferState<E, F> {
    Pull(PullTransfer<E>),
    Push(PushTransfer<F>),
}

impl<E, F> TransferState<E, F> {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            TransferState::Pull(pull) => pull.out.correlation_id(),
            TransferState::Push(push) => push.push_in.correlation_id(),
        }
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            TransferState::Pull(_) => TransferKind::Pull,
            TransferState::Push(_) => TransferKind::Push,
        }
    }

    pub fn as_pull(&self) -> Option<&PullTransfer<E>> {
        match self {
            TransferState::Pull(pull) => Some(pull),
            TransferState::Push(_) => None,
        }
    }

    pub fn as_push(&self) -> Option<&PushTransfer<F>> {
        match self {
            TransferState::Push(push) => Some(push),
            TransferState::Pull(_) => None,
        }
    }
}
