//! Server-side engine for Nova's large-payload streaming transfers.
//!
//! One connection multiplexes many concurrent transfers, each keyed by a correlation id chosen by
//! the client:
//! - **push**: the client uploads a payload as a sequence of chunks, delivered one at a time to a
//!   [`PushHandler`] on the connection's dispatch thread
//! - **pull**: a [`PullHandler`] streams a payload back to the client from a bounded
//!   [`WorkerPool`], split into chunks of at most the configured chunk size
//!
//! Pending transfers live in a [`TransferRegistry`] until they complete, are cancelled by a
//! `CloseNotification`, or are force-closed when the connection drops
//! ([`StreamingServer::handle_closure`]). Every push transfer's `end` callback fires exactly once,
//! whichever of those happens first.
//!
//! Wire messages and framing live in `nova-transfer-proto`.

mod channel;
mod config;
mod error;
mod logger;
mod pool;
mod pull;
mod push;
mod registry;
mod server;
mod state;

pub use channel::{memory_channel, Channel, FramedChannel, MemoryChannel, PeerInfo};
pub use config::{
    ConfigError, TransferConfig, WorkerPoolConfig, CHUNK_SIZE_ENV_VAR, MAX_THREADS_ENV_VAR,
};
pub use error::{ChannelError, DuplicateCorrelationId, ServerError, TransferError};
pub use logger::{TracingTransferLogger, TransferLogger, TransferRecord};
pub use pool::{PoolError, Submission, WorkerPool};
pub use pull::{PullHandler, TransferOut};
pub use push::{PushHandler, PushIn};
pub use registry::TransferRegistry;
pub use server::{StreamingServer, StreamingServerBuilder};
pub use state::{PullTransfer, PushTransfer, TransferKind, TransferState};

pub use nova_transfer_proto as proto;
