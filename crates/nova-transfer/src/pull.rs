//! Server-to-client transfers.
//!
//! A `PullRequest` hands the decoded request and a [`TransferOut`] to the [`PullHandler`] on a
//! worker thread. The handler streams its payload through the handle, which splits it into chunks
//! no larger than the configured chunk size.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use nova_transfer_proto::{Chunk, ChunkType, CorrelationId, Parameter, RequestPrototype};
use parking_lot::Mutex;

use crate::{Channel, TransferError};

/// Application logic producing pulled data.
pub trait PullHandler: Send + Sync + 'static {
    type Request: fmt::Debug + Send + Sync + 'static;
    type Prototype: RequestPrototype<Self::Request>;

    fn prototype(&self) -> Self::Prototype;

    /// Stream the response for `request` through `transfer`.
    ///
    /// Runs on a pull worker and returns once streaming is complete or abandoned. Errors and
    /// panics are logged and never reach the connection.
    fn handle_pull(&self, request: &Self::Request, transfer: &TransferOut) -> anyhow::Result<()>;
}

/// Outbound handle of a pull transfer.
pub struct TransferOut {
    correlation_id: CorrelationId,
    chunk_size: usize,
    channel: Arc<dyn Channel>,
    next_seq_no: AtomicU32,
    closed: AtomicBool,
    finished: AtomicBool,
    staged: Mutex<Vec<Parameter>>,
    sent: Mutex<IndexMap<String, String>>,
}

impl TransferOut {
    pub fn new(correlation_id: CorrelationId, chunk_size: usize, channel: Arc<dyn Channel>) -> Self {
        Self {
            correlation_id,
            chunk_size: chunk_size.max(1),
            channel,
            next_seq_no: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            staged: Mutex::new(Vec::new()),
            sent: Mutex::new(IndexMap::new()),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether the transfer was cancelled (close notification or connection teardown).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Attach a parameter to the next chunk sent.
    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.staged.lock().push(Parameter::new(name, value));
    }

    /// Parameters sent so far, in first-sent order.
    pub fn sent_parameters(&self) -> IndexMap<String, String> {
        self.sent.lock().clone()
    }

    /// Send `payload` as DATA chunks. An empty payload sends nothing.
    pub fn write(&self, payload: &[u8]) -> Result<(), TransferError> {
        self.write_chunks(payload, false)
    }

    /// Send `payload` with its last chunk tagged END. An empty payload sends a single empty END.
    pub fn write_last(&self, payload: &[u8]) -> Result<(), TransferError> {
        self.write_chunks(payload, true)
    }

    /// Send an empty END chunk so the receiver observes completion.
    pub fn finish(&self) -> Result<(), TransferError> {
        self.write_last(&[])
    }

    /// Cancel the transfer. Subsequent writes fail with [`TransferError::Cancelled`]; a write that
    /// is mid-way through a payload stops before its next chunk.
    pub(crate) fn handle_closure(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn write_chunks(&self, payload: &[u8], last: bool) -> Result<(), TransferError> {
        self.check_writable()?;

        if payload.is_empty() {
            return if last {
                self.send_chunk(&[], ChunkType::End)
            } else {
                Ok(())
            };
        }

        let count = payload.len().div_ceil(self.chunk_size);
        for (idx, piece) in payload.chunks(self.chunk_size).enumerate() {
            // Re-check between chunks so a cancellation stops a large write early.
            if idx > 0 {
                self.check_writable()?;
            }
            let chunk_type = if last && idx + 1 == count {
                ChunkType::End
            } else {
                ChunkType::Data
            };
            self.send_chunk(piece, chunk_type)?;
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), TransferError> {
        if self.is_closed() {
            return Err(TransferError::Cancelled {
                correlation_id: self.correlation_id,
            });
        }
        if self.is_finished() {
            return Err(TransferError::AlreadyFinished {
                correlation_id: self.correlation_id,
            });
        }
        Ok(())
    }

    fn send_chunk(&self, payload: &[u8], chunk_type: ChunkType) -> Result<(), TransferError> {
        let parameters = std::mem::take(&mut *self.staged.lock());
        if !parameters.is_empty() {
            let mut sent = self.sent.lock();
            for parameter in &parameters {
                sent.insert(parameter.name.clone(), parameter.value.clone());
            }
        }

        let chunk = Chunk {
            correlation_id: self.correlation_id,
            seq_no: self.next_seq_no.fetch_add(1, Ordering::AcqRel),
            chunk_type,
            payload: payload.to_vec(),
            parameters,
        };
        if chunk_type == ChunkType::End {
            self.finished.store(true, Ordering::Release);
        }

        self.channel
            .send(chunk.into())
            .map_err(|source| TransferError::Channel {
                correlation_id: self.correlation_id,
                source,
            })
    }
}

impl fmt::Debug for TransferOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOut")
            .field("correlation_id", &self.correlation_id)
            .field("chunk_size", &self.chunk_size)
            .field("next_seq_no", &self.next_seq_no.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .field("finished", &self.is_finished())
            .finish()
    }
}
