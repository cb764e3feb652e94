use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use indexmap::IndexMap;
use nova_transfer_proto::{
    Chunk, CloseNotification, CorrelationId, PullRequest, PushRequest, RequestPrototype,
    StreamMessage,
};

use crate::pool::panic_payload_to_str;
use crate::{
    Channel, PeerInfo, PullHandler, PullTransfer, PushHandler, PushIn, PushTransfer,
    ServerError, TransferConfig, TransferError, TransferKind, TransferLogger, TransferOut,
    TransferRecord, TransferRegistry, TransferState, WorkerPool,
};

type State<P, H> = TransferState<<P as PullHandler>::Request, <H as PushHandler>::Request>;

const CANCELLED_BY_RECEIVER: &str = "cancelled by receiver";
const CONNECTION_CLOSED: &str = "connection closed";

/// Server side of one streaming connection.
///
/// Owns the registry of pending transfers and the pull worker pool for that connection. Inbound
/// messages are fed in through [`StreamingServer::dispatch`] (or [`StreamingServer::serve`]) from
/// the connection's dispatch thread; [`StreamingServer::handle_closure`] tears everything down
/// when the connection drops.
pub struct StreamingServer<P: PullHandler, H: PushHandler> {
    inner: Arc<ServerInner<P, H>>,
}

impl<P: PullHandler, H: PushHandler> Clone for StreamingServer<P, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServerInner<P: PullHandler, H: PushHandler> {
    server_info: PeerInfo,
    pull_handler: P,
    push_handler: H,
    logger: Option<Arc<dyn TransferLogger>>,
    chunk_size: usize,
    connection: OnceLock<Connection>,
    registry: TransferRegistry<State<P, H>>,
    pool: WorkerPool,
    closed: AtomicBool,
}

struct Connection {
    client: PeerInfo,
    channel: Arc<dyn Channel>,
}

pub struct StreamingServerBuilder<P, H> {
    server_info: PeerInfo,
    pull_handler: P,
    push_handler: H,
    logger: Option<Arc<dyn TransferLogger>>,
    config: TransferConfig,
}

impl<P: PullHandler, H: PushHandler> StreamingServerBuilder<P, H> {
    pub fn logger(mut self, logger: impl TransferLogger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> StreamingServer<P, H> {
        let pool = WorkerPool::new(
            format!("nova-pull-{}", self.server_info.port),
            &self.config.pool,
        );
        StreamingServer {
            inner: Arc::new(ServerInner {
                server_info: self.server_info,
                pull_handler: self.pull_handler,
                push_handler: self.push_handler,
                logger: self.logger,
                chunk_size: self.config.chunk_size.max(1),
                connection: OnceLock::new(),
                registry: TransferRegistry::new(),
                pool,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<P: PullHandler, H: PushHandler> StreamingServer<P, H> {
    pub fn builder(
        server_info: PeerInfo,
        pull_handler: P,
        push_handler: H,
    ) -> StreamingServerBuilder<P, H> {
        StreamingServerBuilder {
            server_info,
            pull_handler,
            push_handler,
            logger: None,
            config: TransferConfig::default(),
        }
    }

    pub fn server_info(&self) -> &PeerInfo {
        &self.inner.server_info
    }

    /// Bind the server to its connection. Must be called once, before any message is dispatched.
    pub fn handle_open(&self, client: PeerInfo, channel: Arc<dyn Channel>) -> Result<(), ServerError> {
        tracing::debug!(target: "nova.transfer", peer = %client, "connection opened");
        self.inner
            .connection
            .set(Connection { client, channel })
            .map_err(|_| ServerError::AlreadyOpen)
    }

    /// Route one inbound message.
    pub fn dispatch(&self, message: StreamMessage) -> Result<(), ServerError> {
        match message {
            StreamMessage::PushRequest(request) => self.push_request(request),
            StreamMessage::PullRequest(request) => self.pull_request(request),
            StreamMessage::Chunk(chunk) => self.push_chunk(chunk),
            StreamMessage::CloseNotification(notification) => {
                self.close_notification(notification)
            }
        }
    }

    /// Dispatch inbound messages in arrival order until the input ends or the connection closes.
    ///
    /// A dispatch error closes the connection. Teardown always runs before returning.
    pub fn serve<I>(&self, inbound: I)
    where
        I: IntoIterator<Item = StreamMessage>,
    {
        for message in inbound {
            if self.is_closed() {
                break;
            }
            let kind = message.kind();
            let correlation_id = message.correlation_id();
            if let Err(err) = self.dispatch(message) {
                tracing::warn!(
                    target: "nova.transfer",
                    kind,
                    correlation_id,
                    error = %err,
                    "closing connection after dispatch failure"
                );
                self.close_connection();
                break;
            }
        }
        self.handle_closure();
    }

    pub fn push_request(&self, request: PushRequest) -> Result<(), ServerError> {
        let started_at = SystemTime::now();
        let inner = &self.inner;
        let connection = inner.open_connection()?;
        let correlation_id = request.correlation_id;
        tracing::debug!(
            target: "nova.transfer",
            peer = %connection.client,
            correlation_id,
            "received push request"
        );

        if inner.registry.contains(correlation_id) {
            return Err(ServerError::DuplicateCorrelationId(
                crate::DuplicateCorrelationId { correlation_id },
            ));
        }

        let decoded = match inner.push_handler.prototype().decode(&request.request) {
            Ok(decoded) => decoded,
            Err(source) => {
                return Err(self.reject_request(TransferKind::Push, correlation_id, source));
            }
        };

        let transfer = PushTransfer {
            started_at,
            request: Arc::new(decoded),
            push_in: Arc::new(PushIn::new(correlation_id, connection.client.clone())),
        };
        let request = Arc::clone(&transfer.request);
        let push_in = Arc::clone(&transfer.push_in);
        let state = inner
            .registry
            .register(correlation_id, TransferState::Push(transfer))?;

        // Teardown may have finished draining while the request was being decoded.
        if inner.closed.load(Ordering::SeqCst) {
            if inner.registry.remove_if_current(correlation_id, &state) && push_in.set_closed() {
                if let Some(push) = state.as_push() {
                    if let Err(err) = inner.finish_push(push, Some(CONNECTION_CLOSED)) {
                        tracing::warn!(
                            target: "nova.transfer",
                            correlation_id,
                            error = %err,
                            "push handler failed during teardown"
                        );
                    }
                }
            }
            return Err(ServerError::Closed);
        }

        inner
            .push_handler
            .init(&request, &push_in)
            .map_err(|source| ServerError::PushHandler {
                correlation_id,
                source,
            })
    }

    pub fn pull_request(&self, request: PullRequest) -> Result<(), ServerError> {
        let started_at = SystemTime::now();
        let inner = &self.inner;
        let connection = inner.open_connection()?;
        let correlation_id = request.correlation_id;
        tracing::debug!(
            target: "nova.transfer",
            peer = %connection.client,
            correlation_id,
            "received pull request"
        );

        if inner.registry.contains(correlation_id) {
            return Err(ServerError::DuplicateCorrelationId(
                crate::DuplicateCorrelationId { correlation_id },
            ));
        }

        let decoded = match inner.pull_handler.prototype().decode(&request.request) {
            Ok(decoded) => decoded,
            Err(source) => {
                return Err(self.reject_request(TransferKind::Pull, correlation_id, source));
            }
        };

        let request = Arc::new(decoded);
        let out = Arc::new(TransferOut::new(
            correlation_id,
            inner.chunk_size,
            Arc::clone(&connection.channel),
        ));
        let state = inner.registry.register(
            correlation_id,
            TransferState::Pull(PullTransfer {
                started_at,
                request: Arc::clone(&request),
                out: Arc::clone(&out),
            }),
        )?;

        let worker_inner = Arc::clone(inner);
        let worker_state = Arc::clone(&state);
        let worker_out = Arc::clone(&out);
        let submitted = inner.pool.execute(move || {
            worker_inner.run_pull(&worker_state, &request, &worker_out);
        });

        match submitted {
            Ok(submission) => {
                tracing::trace!(
                    target: "nova.transfer",
                    correlation_id,
                    ?submission,
                    "scheduled pull worker"
                );
                Ok(())
            }
            Err(_) => {
                // Lost a race with teardown; the pool is gone, so undo the registration.
                if inner.registry.remove_if_current(correlation_id, &state) {
                    out.handle_closure();
                }
                Err(ServerError::Closed)
            }
        }
    }

    /// Deliver one chunk of a push transfer.
    ///
    /// Chunks for a correlation id are assumed to arrive in sequence order and exactly once;
    /// nothing here reorders or deduplicates them. Over a transport without that guarantee a
    /// late chunk overwrites the current payload and an early END completes the transfer.
    pub fn push_chunk(&self, chunk: Chunk) -> Result<(), ServerError> {
        let inner = &self.inner;
        let correlation_id = chunk.correlation_id;
        tracing::trace!(
            target: "nova.transfer",
            correlation_id,
            seq_no = chunk.seq_no,
            chunk_type = ?chunk.chunk_type,
            "received push chunk"
        );

        let Some(state) = inner.registry.lookup(correlation_id) else {
            // Only happens when the chunk raced a close.
            tracing::debug!(
                target: "nova.transfer",
                correlation_id,
                "no pending transfer for chunk"
            );
            return Ok(());
        };
        let Some(push) = state.as_push() else {
            return Err(ServerError::UnexpectedTransferKind {
                correlation_id,
                expected: TransferKind::Push,
                actual: TransferKind::Pull,
            });
        };

        let is_end = chunk.is_end();
        for parameter in chunk.parameters {
            push.push_in.provide_parameter(parameter.name, parameter.value);
        }
        push.push_in.set_data(Bytes::from(chunk.payload));

        inner
            .push_handler
            .data(&push.request, &push.push_in)
            .map_err(|source| ServerError::PushHandler {
                correlation_id,
                source,
            })?;

        if is_end {
            inner.registry.remove_if_current(correlation_id, &state);
            if push.push_in.set_closed() {
                inner.finish_push(push, None)?;
            }
        }
        Ok(())
    }

    /// Cancel a pull transfer abandoned by its receiver. Unknown ids are ignored.
    pub fn close_notification(&self, notification: CloseNotification) -> Result<(), ServerError> {
        let inner = &self.inner;
        let correlation_id = notification.correlation_id;

        let removed = inner
            .registry
            .remove_if(correlation_id, |state| state.kind() == TransferKind::Pull);
        match removed {
            Some(state) => {
                tracing::debug!(
                    target: "nova.transfer",
                    correlation_id,
                    "received close notification"
                );
                if let Some(pull) = state.as_pull() {
                    pull.out.handle_closure();
                    inner.log_pull(pull, Some(CANCELLED_BY_RECEIVER));
                }
                Ok(())
            }
            None => match inner.registry.lookup(correlation_id) {
                Some(state) if state.kind() == TransferKind::Push => {
                    Err(ServerError::UnexpectedTransferKind {
                        correlation_id,
                        expected: TransferKind::Pull,
                        actual: TransferKind::Push,
                    })
                }
                _ => {
                    tracing::debug!(
                        target: "nova.transfer",
                        correlation_id,
                        "close notification for finished transfer"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Force-close every transfer of this connection and stop its pull workers.
    ///
    /// Push transfers get their `end` callback (unless END already delivered it), pull transfers
    /// are cancelled, and queued pull work that never started is discarded. A no-op if the
    /// connection was never opened.
    pub fn handle_closure(&self) {
        let inner = &self.inner;
        let Some(connection) = inner.connection.get() else {
            return;
        };
        if !inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                target: "nova.transfer",
                peer = %connection.client,
                pending = inner.registry.len(),
                "closing connection"
            );
        }

        inner.drain_transfers();
        let discarded = inner.pool.shutdown_now();
        // Requests that registered while the first drain was running.
        inner.drain_transfers();

        if discarded > 0 {
            tracing::debug!(
                target: "nova.transfer",
                peer = %connection.client,
                discarded,
                "discarded queued pull work"
            );
        }
    }

    /// Close the underlying channel. The transport is expected to follow up with
    /// [`StreamingServer::handle_closure`].
    pub fn close_connection(&self) {
        if let Some(connection) = self.inner.connection.get() {
            connection.channel.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self
                .inner
                .connection
                .get()
                .is_some_and(|connection| connection.channel.is_closed())
    }

    /// Correlation ids of the transfers currently pending, sorted.
    pub fn pending_transfers(&self) -> Vec<CorrelationId> {
        let mut ids = self.inner.registry.ids();
        ids.sort_unstable();
        ids
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    fn reject_request(
        &self,
        kind: TransferKind,
        correlation_id: CorrelationId,
        source: nova_transfer_proto::DecodeError,
    ) -> ServerError {
        // No transfer exists yet to report the failure against, so the connection goes.
        tracing::warn!(
            target: "nova.transfer",
            %kind,
            correlation_id,
            error = %source,
            "invalid request payload; closing connection"
        );
        self.close_connection();
        ServerError::InvalidRequest {
            kind,
            correlation_id,
            source,
        }
    }
}

impl<P: PullHandler, H: PushHandler> ServerInner<P, H> {
    fn open_connection(&self) -> Result<&Connection, ServerError> {
        let connection = self.connection.get().ok_or(ServerError::NotOpen)?;
        if self.closed.load(Ordering::Acquire) || connection.channel.is_closed() {
            return Err(ServerError::Closed);
        }
        Ok(connection)
    }

    fn run_pull(
        &self,
        state: &Arc<State<P, H>>,
        request: &P::Request,
        out: &TransferOut,
    ) {
        let correlation_id = out.correlation_id();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.pull_handler.handle_pull(request, out)
        }));

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                let cancelled = err
                    .downcast_ref::<TransferError>()
                    .is_some_and(TransferError::is_cancelled);
                if cancelled {
                    tracing::debug!(
                        target: "nova.transfer",
                        correlation_id,
                        "pull handler stopped after cancellation"
                    );
                } else {
                    tracing::warn!(
                        target: "nova.transfer",
                        correlation_id,
                        error = %format!("{err:#}"),
                        "pull handler failed"
                    );
                }
                Some(format!("{err:#}"))
            }
            Err(panic) => {
                let message = panic_payload_to_str(&*panic);
                tracing::warn!(
                    target: "nova.transfer",
                    correlation_id,
                    panic = %message,
                    "pull handler panicked"
                );
                Some(format!("pull handler panicked: {message}"))
            }
        };

        // Cancellation paths already removed (and logged) the transfer; only log if we still own
        // the registry entry.
        if self.registry.remove_if_current(correlation_id, state) {
            tracing::debug!(target: "nova.transfer", correlation_id, "pull transfer complete");
            if let Some(pull) = state.as_pull() {
                self.log_pull(pull, error.as_deref());
            }
        }
    }

    fn finish_push(
        &self,
        push: &PushTransfer<H::Request>,
        reason: Option<&str>,
    ) -> Result<(), ServerError> {
        let correlation_id = push.push_in.correlation_id();
        let result = self.push_handler.end(&push.request, &push.push_in);

        let error = match &result {
            Ok(()) => reason.map(str::to_string),
            Err(err) => Some(format!("{err:#}")),
        };
        self.log_transfer(
            TransferKind::Push,
            correlation_id,
            &*push.request,
            error.as_deref(),
            &push.push_in.parameters(),
            push.started_at,
        );

        result.map_err(|source| ServerError::PushHandler {
            correlation_id,
            source,
        })
    }

    fn drain_transfers(&self) {
        for (correlation_id, state) in self.registry.drain() {
            tracing::debug!(target: "nova.transfer", correlation_id, "force closing transfer");
            match &*state {
                TransferState::Push(push) => {
                    if push.push_in.set_closed() {
                        if let Err(err) = self.finish_push(push, Some(CONNECTION_CLOSED)) {
                            // Nobody is left to receive the error.
                            tracing::warn!(
                                target: "nova.transfer",
                                correlation_id,
                                error = %err,
                                "push handler failed during teardown"
                            );
                        }
                    }
                }
                TransferState::Pull(pull) => {
                    pull.out.handle_closure();
                    self.log_pull(pull, Some(CONNECTION_CLOSED));
                }
            }
        }
    }

    fn log_pull(&self, pull: &PullTransfer<P::Request>, error: Option<&str>) {
        let error = match error {
            None if pull.out.is_closed() => Some(CANCELLED_BY_RECEIVER),
            other => other,
        };
        self.log_transfer(
            TransferKind::Pull,
            pull.out.correlation_id(),
            &*pull.request,
            error,
            &pull.out.sent_parameters(),
            pull.started_at,
        );
    }

    fn log_transfer(
        &self,
        kind: TransferKind,
        correlation_id: CorrelationId,
        request: &dyn fmt::Debug,
        error: Option<&str>,
        parameters: &IndexMap<String, String>,
        started_at: SystemTime,
    ) {
        let (Some(logger), Some(connection)) = (&self.logger, self.connection.get()) else {
            return;
        };
        logger.log_transfer(&TransferRecord {
            client: &connection.client,
            server: &self.server_info,
            kind,
            correlation_id,
            request,
            error,
            parameters,
            started_at,
            finished_at: SystemTime::now(),
        });
    }
}

impl<P: PullHandler, H: PushHandler> fmt::Debug for StreamingServer<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingServer")
            .field("server_info", &self.inner.server_info)
            .field(
                "client",
                &self.inner.connection.get().map(|connection| &connection.client),
            )
            .field("registry", &self.inner.registry)
            .field("pool", &self.inner.pool)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: PullHandler, H: PushHandler> fmt::Display for StreamingServer<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamingServer[{}]", self.inner.server_info)
    }
}
