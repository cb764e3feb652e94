use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nova_transfer::proto::{
    BincodePrototype, ChunkType, DecodeError, RequestPrototype, StreamMessage,
};
use nova_transfer::{
    memory_channel, Channel, PeerInfo, PushHandler, PushIn, ServerError, StreamingServer,
};
use pretty_assertions::assert_eq;

use super::support::{
    chunk, config, harness, pull_request, push_request, test_pull, wait_until, Behavior,
    PushEvent, TestPush, Upload,
};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn closure_force_closes_every_pending_transfer() {
    let h = harness(1000);
    h.server
        .pull_request(pull_request(1, 10, Behavior::BlockThenWrite))
        .unwrap();
    h.server
        .pull_request(pull_request(2, 10, Behavior::BlockThenWrite))
        .unwrap();
    h.server.push_request(push_request(3, "upload")).unwrap();
    for _ in 0..2 {
        h.pull.started.recv_timeout(TIMEOUT).unwrap();
    }
    assert_eq!(h.server.pending_transfers(), vec![1, 2, 3]);

    h.server.handle_closure();

    assert!(h.server.pending_transfers().is_empty());
    assert!(h.server.is_closed());
    assert!(h.server.worker_pool().is_shutdown());
    assert_eq!(
        h.push_events(),
        vec![PushEvent::Init(3, "upload".into()), PushEvent::End(3)]
    );

    h.pull.release.send(()).unwrap();
    h.pull.release.send(()).unwrap();
    let mut results: Vec<_> = (0..2)
        .map(|_| h.pull.results.recv_timeout(TIMEOUT).unwrap())
        .collect();
    results.sort_by_key(|(id, _)| *id);
    assert_eq!(
        results,
        vec![
            (1, Err("transfer 1 was cancelled".to_string())),
            (2, Err("transfer 2 was cancelled".to_string())),
        ]
    );
    assert!(h.outbound_chunks().is_empty());

    let logged = h.logged();
    assert_eq!(logged.len(), 3);
    assert!(logged
        .iter()
        .all(|record| record.error.as_deref() == Some("connection closed")));

    assert!(matches!(
        h.server.pull_request(pull_request(4, 10, Behavior::WriteLast)),
        Err(ServerError::Closed)
    ));

    // A second closure finds nothing left to close.
    h.server.handle_closure();
    assert_eq!(h.push_events().len(), 2);
    assert_eq!(h.logged().len(), 3);
}

#[test]
fn end_fires_once_when_final_chunk_races_closure() {
    for _ in 0..200 {
        let h = harness(1000);
        h.server.push_request(push_request(5, "race")).unwrap();
        h.server
            .push_chunk(chunk(5, 0, ChunkType::Data, b"a"))
            .unwrap();

        let server = h.server.clone();
        let sender = std::thread::spawn(move || {
            server
                .push_chunk(chunk(5, 1, ChunkType::End, b"b"))
                .unwrap();
        });
        h.server.handle_closure();
        sender.join().unwrap();

        let events = h.push_events();
        let ends = events
            .iter()
            .filter(|event| matches!(event, PushEvent::End(5)))
            .count();
        let data = events
            .iter()
            .filter(|event| matches!(event, PushEvent::Data(5, ..)))
            .count();
        assert_eq!(ends, 1, "{events:?}");
        assert!(data == 1 || data == 2, "{events:?}");
        assert_eq!(h.logged().len(), 1);
    }
}

#[test]
fn closure_before_open_is_a_no_op() {
    let (pull, _probe) = test_pull();
    let server = StreamingServer::builder(PeerInfo::new("server", 7001), pull, TestPush::default())
        .config(config(1000))
        .build();

    server.handle_closure();
    assert!(!server.is_closed());
    assert!(!server.worker_pool().is_shutdown());
    assert!(matches!(
        server.push_request(push_request(1, "early")),
        Err(ServerError::NotOpen)
    ));
}

#[test]
fn serve_dispatches_inbound_messages_then_tears_down() {
    let push = TestPush::default();
    let push_events = Arc::clone(&push.events);
    let (pull, _probe) = test_pull();
    let server = StreamingServer::builder(PeerInfo::new("server", 7002), pull, push)
        .config(config(4))
        .build();

    let client = PeerInfo::new("client", 52000);
    let (channel, outbound) = memory_channel(64, client.clone());
    let channel: Arc<dyn Channel> = Arc::new(channel);
    server.handle_open(client, Arc::clone(&channel)).unwrap();

    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded::<StreamMessage>();
    let serving = {
        let server = server.clone();
        std::thread::spawn(move || server.serve(inbound_rx))
    };

    inbound_tx.send(push_request(1, "notes.txt").into()).unwrap();
    inbound_tx
        .send(chunk(1, 0, ChunkType::End, b"hello").into())
        .unwrap();
    inbound_tx
        .send(pull_request(2, 10, Behavior::WriteLast).into())
        .unwrap();
    inbound_tx.send(push_request(3, "unfinished").into()).unwrap();

    let mut received = Vec::new();
    while received.last().map_or(true, |chunk: &nova_transfer::proto::Chunk| !chunk.is_end()) {
        match outbound.recv_timeout(TIMEOUT).unwrap() {
            StreamMessage::Chunk(chunk) => received.push(chunk),
            other => panic!("unexpected outbound message {other:?}"),
        }
    }
    let sizes: Vec<_> = received.iter().map(|chunk| chunk.payload.len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    drop(inbound_tx);
    serving.join().unwrap();

    assert!(server.pending_transfers().is_empty());
    assert_eq!(
        *push_events.lock().unwrap(),
        vec![
            PushEvent::Init(1, "notes.txt".into()),
            PushEvent::Data(1, b"hello".to_vec(), Vec::new()),
            PushEvent::End(1),
            PushEvent::Init(3, "unfinished".into()),
            PushEvent::End(3),
        ]
    );
    wait_until("pool shut down", || server.worker_pool().is_shutdown());
}

#[test]
fn serve_stops_at_the_first_protocol_error() {
    let h = harness(1000);
    let inbound: Vec<StreamMessage> = vec![
        push_request(1, "a").into(),
        push_request(1, "again").into(),
        push_request(2, "never seen").into(),
    ];

    h.server.serve(inbound);

    assert!(h.channel.is_closed());
    assert!(h.server.is_closed());
    assert_eq!(
        h.push_events(),
        vec![PushEvent::Init(1, "a".into()), PushEvent::End(1)]
    );
}

/// Decoder that parks until the test releases it.
#[derive(Clone)]
struct ParkedDecode {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl RequestPrototype<Upload> for ParkedDecode {
    fn decode(&self, bytes: &[u8]) -> Result<Upload, DecodeError> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(TIMEOUT);
        BincodePrototype::<Upload>::new().decode(bytes)
    }
}

struct ParkedPush {
    decode: ParkedDecode,
    inits: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
}

impl PushHandler for ParkedPush {
    type Request = Upload;
    type Prototype = ParkedDecode;

    fn prototype(&self) -> Self::Prototype {
        self.decode.clone()
    }

    fn init(&self, _request: &Upload, _transfer: &PushIn) -> anyhow::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn data(&self, _request: &Upload, _transfer: &PushIn) -> anyhow::Result<()> {
        Ok(())
    }

    fn end(&self, _request: &Upload, _transfer: &PushIn) -> anyhow::Result<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn push_registered_during_closure_is_closed_with_it() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let inits = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    let push = ParkedPush {
        decode: ParkedDecode {
            entered: entered_tx,
            release: release_rx,
        },
        inits: Arc::clone(&inits),
        ends: Arc::clone(&ends),
    };
    let (pull, _probe) = test_pull();
    let server = StreamingServer::builder(PeerInfo::new("server", 7003), pull, push)
        .config(config(1000))
        .build();
    let client = PeerInfo::new("client", 53000);
    let (channel, _outbound) = memory_channel(16, client.clone());
    server.handle_open(client, Arc::new(channel)).unwrap();

    let requesting = {
        let server = server.clone();
        std::thread::spawn(move || server.push_request(push_request(9, "late")))
    };
    entered_rx.recv_timeout(TIMEOUT).unwrap();
    server.handle_closure();
    release_tx.send(()).unwrap();

    let result = requesting.join().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)), "{result:?}");
    assert!(server.pending_transfers().is_empty());
    assert_eq!(inits.load(Ordering::SeqCst), 0);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}
