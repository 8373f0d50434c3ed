//! Message codec: application text to wire bytes and back.
//!
//! Frame layout: 1 byte version, 4 bytes LE length, then the text as UTF-8.
//! The transport preserves message boundaries; the header lets a newer peer
//! reject frames it cannot read instead of misinterpreting them.

/// Current codec version, first byte of every frame.
pub const CODEC_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 4;

/// Largest text (in bytes) a single message may carry.
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// Encode text into a single frame.
pub fn encode(text: &str) -> Result<Vec<u8>, EncodeError> {
    let body = text.as_bytes();
    if body.len() > MAX_TEXT_LEN {
        return Err(EncodeError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(CODEC_VERSION);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode a frame produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    if bytes[0] != CODEC_VERSION {
        return Err(DecodeError::UnsupportedVersion(bytes[0]));
    }
    let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if declared != body.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    let text = std::str::from_utf8(body)?;
    Ok(text.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("message is {0} bytes, max {MAX_TEXT_LEN}")]
    TooLarge(usize),
}

/// Payload could not be read as a message. Recoverable: the message is dropped, the link stays up.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),
    #[error("length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
