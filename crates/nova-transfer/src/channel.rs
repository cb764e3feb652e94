use std::fmt;
use std::io::Write;

use crossbeam_channel as channel;
use nova_transfer_proto::{write_frame, StreamMessage};
use parking_lot::Mutex;

use crate::ChannelError;

/// Identity of one end of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outbound half of a connection.
///
/// `send` may block when the underlying transport applies backpressure. Implementations must be
/// safe to call from the dispatch thread and pull workers concurrently.
pub trait Channel: Send + Sync {
    fn send(&self, message: StreamMessage) -> Result<(), ChannelError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Remote end of the connection.
    fn peer(&self) -> &PeerInfo;
}

/// In-process channel backed by a bounded `crossbeam_channel` queue.
///
/// `send` blocks while the queue is full. Closing drops the sender so the receiver observes a
/// disconnect once it has drained the queued messages.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Mutex<Option<channel::Sender<StreamMessage>>>,
    peer: PeerInfo,
}

/// Create a [`MemoryChannel`] and the receiver that observes everything sent through it.
pub fn memory_channel(
    capacity: usize,
    peer: PeerInfo,
) -> (MemoryChannel, channel::Receiver<StreamMessage>) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (
        MemoryChannel {
            tx: Mutex::new(Some(tx)),
            peer,
        },
        rx,
    )
}

impl Channel for MemoryChannel {
    fn send(&self, message: StreamMessage) -> Result<(), ChannelError> {
        // Clone the sender so a blocked send doesn't hold the lock against `close`.
        let tx = self.tx.lock().clone().ok_or(ChannelError::Closed)?;
        tx.send(message).map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    fn peer(&self) -> &PeerInfo {
        &self.peer
    }
}

/// Channel that writes length-prefixed frames to any [`Write`] (typically a socket).
pub struct FramedChannel<W> {
    writer: Mutex<Option<W>>,
    peer: PeerInfo,
}

impl<W: Write + Send> FramedChannel<W> {
    pub fn new(writer: W, peer: PeerInfo) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            peer,
        }
    }

    /// Close the channel and hand back the writer, if it was still open.
    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner()
    }
}

impl<W> fmt::Debug for FramedChannel<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send> Channel for FramedChannel<W> {
    fn send(&self, message: StreamMessage) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        write_frame(writer, &message)?;
        writer
            .flush()
            .map_err(|err| ChannelError::Codec(err.into()))
    }

    fn close(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.flush();
        }
    }

    fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    fn peer(&self) -> &PeerInfo {
        &self.peer
    }
}
