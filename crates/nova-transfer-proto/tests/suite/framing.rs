use nova_transfer_proto::{
    decode_message, encode_message, read_frame, write_frame, CloseNotification, CodecError,
    PullRequest, StreamMessage,
};

fn pull(correlation_id: u32) -> StreamMessage {
    StreamMessage::PullRequest(PullRequest {
        correlation_id,
        request: vec![1, 2, 3],
    })
}

#[test]
fn decode_message_rejects_trailing_bytes() {
    let mut bytes = encode_message(&pull(7)).unwrap();
    bytes.extend_from_slice(&[0, 0]);
    assert!(matches!(
        decode_message(&bytes),
        Err(CodecError::TrailingBytes { count: 2 })
    ));
}

#[test]
fn read_frame_rejects_truncated_payload() {
    let mut frame = Vec::new();
    write_frame(&mut frame, &pull(7)).unwrap();
    let truncated = &frame[..frame.len() - 1];
    assert!(matches!(
        read_frame(&mut &truncated[..]),
        Err(CodecError::Io(_))
    ));
}

#[test]
fn read_frame_rejects_truncated_length_prefix() {
    let bytes = [4u8, 0];
    assert!(read_frame(&mut &bytes[..]).is_err());
}

#[test]
fn read_frame_rejects_invalid_payload() {
    let mut bytes = Vec::from(1u32.to_le_bytes());
    bytes.push(0xff);
    assert!(matches!(
        read_frame(&mut bytes.as_slice()),
        Err(CodecError::Decode { .. })
    ));
}

#[test]
fn read_frame_returns_none_on_clean_eof() {
    let mut frame = Vec::new();
    write_frame(
        &mut frame,
        &StreamMessage::CloseNotification(CloseNotification { correlation_id: 1 }),
    )
    .unwrap();

    let mut reader = frame.as_slice();
    assert!(read_frame(&mut reader).unwrap().is_some());
    assert!(read_frame(&mut reader).unwrap().is_none());
}
