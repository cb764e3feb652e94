use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use nova_transfer_proto::CorrelationId;

use crate::{PeerInfo, TransferKind};

/// Summary of one finished transfer, handed to a [`TransferLogger`].
pub struct TransferRecord<'a> {
    pub client: &'a PeerInfo,
    pub server: &'a PeerInfo,
    pub kind: TransferKind,
    pub correlation_id: CorrelationId,
    pub request: &'a dyn fmt::Debug,
    /// `None` when the transfer completed normally.
    pub error: Option<&'a str>,
    pub parameters: &'a IndexMap<String, String>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl TransferRecord<'_> {
    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .duration_since(self.started_at)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

impl fmt::Debug for TransferRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRecord")
            .field("client", self.client)
            .field("server", self.server)
            .field("kind", &self.kind)
            .field("correlation_id", &self.correlation_id)
            .field("request", self.request)
            .field("error", &self.error)
            .field("parameters", self.parameters)
            .field("duration_ms", &self.duration_ms())
            .finish()
    }
}

/// Audit sink for finished transfers. Each transfer is reported exactly once, at the point it
/// leaves the registry.
pub trait TransferLogger: Send + Sync {
    fn log_transfer(&self, record: &TransferRecord<'_>);
}

/// Reports transfers as `tracing` events under the `nova.transfer.audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransferLogger;

impl TransferLogger for TracingTransferLogger {
    fn log_transfer(&self, record: &TransferRecord<'_>) {
        let started_ms = record
            .started_at
            .duration_since(UNIX_EPOCH)
            .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        match record.error {
            None => tracing::info!(
                target: "nova.transfer.audit",
                client = %record.client,
                server = %record.server,
                kind = %record.kind,
                correlation_id = record.correlation_id,
                request = ?record.request,
                parameters = ?record.parameters,
                started_ms,
                duration_ms = record.duration_ms(),
                "transfer complete"
            ),
            Some(error) => tracing::info!(
                target: "nova.transfer.audit",
                client = %record.client,
                server = %record.server,
                kind = %record.kind,
                correlation_id = record.correlation_id,
                request = ?record.request,
                parameters = ?record.parameters,
                started_ms,
                duration_ms = record.duration_ms(),
                error,
                "transfer failed"
            ),
        }
    }
}
