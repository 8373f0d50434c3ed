//! Message framing: a 4-byte LE body length, then the bincode body.
//!
//! A discovery datagram carries exactly one frame. On a link the header stays in the clear and the
//! body is sealed, so the body helpers are public too.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;

/// Largest body accepted from the network. Codec frames are capped well below this.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Serialize a message body and check it against the cap.
pub fn encode_body(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(body.len()));
    }
    Ok(body)
}

pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(body)?)
}

/// Prefix `body` with its length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Body length announced by a header, rejected when over the cap.
pub fn body_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Encode a message as one complete frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    Ok(frame(&encode_body(msg)?))
}

/// Decode the frame at the front of `bytes`; returns the message and the bytes consumed.
/// `NeedMore` means the buffer ends mid-frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let header: [u8; LEN_SIZE] = bytes
        .get(..LEN_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let end = LEN_SIZE + body_len(header)?;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_body(body)?, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("serialize: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame body is {0} bytes, max {MAX_FRAME_LEN}")]
    TooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame body is {0} bytes, max {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("deserialize: {0}")]
    Decode(#[from] bincode::Error),
}
