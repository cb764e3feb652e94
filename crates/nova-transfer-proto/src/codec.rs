use std::io::{self, Read, Write};

use bincode::Options;

use crate::{StreamMessage, MAX_MESSAGE_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("{count} trailing bytes after message")]
    TrailingBytes { count: usize },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_BYTES as u64)
        .reject_trailing_bytes()
}

pub fn encode_message(message: &StreamMessage) -> Result<Vec<u8>, CodecError> {
    options().serialize(message).map_err(|err| match *err {
        bincode::ErrorKind::SizeLimit => CodecError::FrameTooLarge {
            len: MAX_MESSAGE_BYTES.saturating_add(1),
            max: MAX_MESSAGE_BYTES,
        },
        other => CodecError::Encode {
            message: other.to_string(),
        },
    })
}

pub fn decode_message(bytes: &[u8]) -> Result<StreamMessage, CodecError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    let mut rest = bytes;
    let message = options()
        .allow_trailing_bytes()
        .deserialize_from(&mut rest)
        .map_err(|err| CodecError::Decode {
            message: err.to_string(),
        })?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes { count: rest.len() });
    }
    Ok(message)
}

/// Encode `message` and write it as a single length-prefixed frame.
pub fn write_frame<W: Write + ?Sized>(w: &mut W, message: &StreamMessage) -> Result<(), CodecError> {
    let payload = encode_message(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        len: payload.len(),
        max: MAX_MESSAGE_BYTES,
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix. The length is validated before any
/// payload allocation; EOF inside a frame is an error.
pub fn read_frame<R: Read + ?Sized>(r: &mut R) -> Result<Option<StreamMessage>, CodecError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match r.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame length prefix",
                )))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    decode_message(&payload).map(Some)
}
