//! Client-to-server transfers.
//!
//! A push starts with a `PushRequest`, after which the client streams `Chunk`s for the same
//! correlation id. Each chunk is handed to the [`PushHandler`] on the dispatch thread as it
//! arrives; the handler sees one chunk at a time through the transfer's [`PushIn`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use nova_transfer_proto::{CorrelationId, RequestPrototype};
use parking_lot::Mutex;

use crate::PeerInfo;

/// Application logic consuming pushed data.
///
/// Callbacks run synchronously on the connection's dispatch thread (except `end`, which may run
/// on the thread tearing the connection down). Errors are not contained here: they propagate to
/// whoever dispatched the message.
pub trait PushHandler: Send + Sync + 'static {
    type Request: fmt::Debug + Send + Sync + 'static;
    type Prototype: RequestPrototype<Self::Request>;

    fn prototype(&self) -> Self::Prototype;

    /// Called once after the transfer is registered, before any chunk is delivered.
    fn init(&self, request: &Self::Request, transfer: &PushIn) -> anyhow::Result<()>;

    /// Called once per chunk, with the chunk's payload available via [`PushIn::data`].
    fn data(&self, request: &Self::Request, transfer: &PushIn) -> anyhow::Result<()>;

    /// Called exactly once per transfer: after the END chunk, or on connection teardown.
    fn end(&self, request: &Self::Request, transfer: &PushIn) -> anyhow::Result<()>;
}

/// Inbound handle of a push transfer.
pub struct PushIn {
    correlation_id: CorrelationId,
    client: PeerInfo,
    data: Mutex<Bytes>,
    parameters: Mutex<IndexMap<String, String>>,
    closed: AtomicBool,
}

impl PushIn {
    pub fn new(correlation_id: CorrelationId, client: PeerInfo) -> Self {
        Self {
            correlation_id,
            client,
            data: Mutex::new(Bytes::new()),
            parameters: Mutex::new(IndexMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn client(&self) -> &PeerInfo {
        &self.client
    }

    /// Payload of the chunk currently being delivered.
    pub fn data(&self) -> Bytes {
        self.data.lock().clone()
    }

    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters.lock().get(name).cloned()
    }

    /// Every parameter received so far, in first-seen order. Later values overwrite earlier ones.
    pub fn parameters(&self) -> IndexMap<String, String> {
        self.parameters.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_data(&self, payload: Bytes) {
        *self.data.lock() = payload;
    }

    pub(crate) fn provide_parameter(&self, name: String, value: String) {
        self.parameters.lock().insert(name, value);
    }

    /// Mark the transfer closed. Returns `true` only for the single caller that performed the
    /// transition; that caller owns the `end` callback.
    pub(crate) fn set_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for PushIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushIn")
            .field("correlation_id", &self.correlation_id)
            .field("client", &self.client)
            .field("data_len", &self.data.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
