use nova_transfer_proto::{
    Chunk, ChunkType, CloseNotification, Parameter, PullRequest, PushRequest, StreamMessage,
};
use pretty_assertions::assert_eq;

#[test]
fn correlation_id_and_kind_cover_every_message() {
    let messages: Vec<StreamMessage> = vec![
        PushRequest {
            correlation_id: 1,
            request: Vec::new(),
        }
        .into(),
        PullRequest {
            correlation_id: 2,
            request: Vec::new(),
        }
        .into(),
        Chunk {
            correlation_id: 3,
            seq_no: 0,
            chunk_type: ChunkType::Data,
            payload: b"ab".to_vec(),
            parameters: vec![Parameter::new("k", "v")],
        }
        .into(),
        CloseNotification { correlation_id: 4 }.into(),
    ];

    let summary: Vec<(u32, &str)> = messages
        .iter()
        .map(|msg| (msg.correlation_id(), msg.kind()))
        .collect();

    assert_eq!(
        summary,
        vec![
            (1, "push_request"),
            (2, "pull_request"),
            (3, "chunk"),
            (4, "close_notification"),
        ]
    );
}

#[test]
fn end_chunks_are_detected() {
    let chunk = Chunk {
        correlation_id: 3,
        seq_no: 1,
        chunk_type: ChunkType::End,
        payload: Vec::new(),
        parameters: Vec::new(),
    };
    assert!(chunk.is_end());
}
