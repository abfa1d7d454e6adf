//! Protocol codec for encoding/decoding frames
//!
//! Handles token escaping, header validation and line framing on the byte
//! stream. Decoding is strict: anything that would not re-encode to the same
//! bytes is rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Origin, RawPacket, FIELD_DELIMITER, FRAME_TERMINATOR};

/// Default maximum frame size (64 KiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Number of header tokens preceding the value fields
const HEADER_TOKENS: usize = 4;

const ESCAPE: char = '\\';

/// Decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLong(usize, usize),

    #[error("Frame header is incomplete")]
    MissingHeader,

    #[error("Invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    #[error("Unescaped control character at byte {0}")]
    UnescapedControl(usize),

    #[error("Invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Field count mismatch: declared {declared}, found {actual}")]
    FieldCountMismatch { declared: usize, actual: usize },

    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: u32, actual: u32 },

    #[error("Invalid boolean in {field}: {value:?}")]
    InvalidBool { field: &'static str, value: String },

    #[error("Malformed list in {field}")]
    MalformedList { field: &'static str },
}

/// Decode one frame (without its terminator) into a raw packet.
pub fn decode(frame: &[u8]) -> Result<RawPacket, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|_| DecodeError::InvalidUtf8)?;
    let mut tokens = split_tokens(text)?;

    if tokens.len() < HEADER_TOKENS {
        return Err(DecodeError::MissingHeader);
    }

    let code = parse_u32(&tokens[1], "message type")?;
    let origin = parse_i32(&tokens[2], "origin")?;
    let declared = parse_usize(&tokens[3], "field count")?;
    let actual = tokens.len() - HEADER_TOKENS;
    if declared != actual {
        return Err(DecodeError::FieldCountMismatch { declared, actual });
    }

    let fields = tokens.split_off(HEADER_TOKENS);
    let version = tokens.swap_remove(0);

    Ok(RawPacket::with_code(
        version,
        code,
        Origin::from_int(origin),
        fields,
    ))
}

/// Encode a raw packet into one frame (without its terminator).
pub fn encode(packet: &RawPacket) -> Vec<u8> {
    let mut out = String::with_capacity(32);
    escape_into(&mut out, packet.version());
    out.push(FIELD_DELIMITER);
    out.push_str(&packet.code().to_string());
    out.push(FIELD_DELIMITER);
    out.push_str(&packet.origin().to_int().to_string());
    out.push(FIELD_DELIMITER);
    out.push_str(&packet.fields().len().to_string());

    for field in packet.fields() {
        out.push(FIELD_DELIMITER);
        escape_into(&mut out, field);
    }

    out.into_bytes()
}

/// Encode a raw packet and append the frame terminator, ready for the wire.
pub fn encode_frame(packet: &RawPacket) -> Bytes {
    let frame = encode(packet);
    let mut buf = BytesMut::with_capacity(frame.len() + 1);
    buf.put_slice(&frame);
    buf.put_u8(FRAME_TERMINATOR);
    buf.freeze()
}

fn escape_into(out: &mut String, token: &str) {
    for c in token.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn split_tokens(text: &str) -> Result<Vec<String>, DecodeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = text.char_indices();

    while let Some((pos, c)) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some((_, '\\')) => current.push('\\'),
                Some((_, '|')) => current.push('|'),
                Some((_, 'n')) => current.push('\n'),
                Some((_, 'r')) => current.push('\r'),
                _ => return Err(DecodeError::InvalidEscape(pos)),
            },
            FIELD_DELIMITER => tokens.push(std::mem::take(&mut current)),
            '\n' | '\r' => return Err(DecodeError::UnescapedControl(pos)),
            other => current.push(other),
        }
    }
    tokens.push(current);

    Ok(tokens)
}

/// Parse a non-negative integer in canonical form (no sign, no leading zeros).
pub(crate) fn parse_unsigned(token: &str, field: &'static str) -> Result<u64, DecodeError> {
    let canonical = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));

    if !canonical {
        return Err(invalid_number(token, field));
    }

    token.parse().map_err(|_| invalid_number(token, field))
}

/// Parse a signed integer in canonical form (`-0` is rejected).
pub(crate) fn parse_signed(token: &str, field: &'static str) -> Result<i64, DecodeError> {
    match token.strip_prefix('-') {
        Some(magnitude) => {
            let value = parse_unsigned(magnitude, field)?;
            if value == 0 {
                return Err(invalid_number(token, field));
            }
            i64::try_from(value)
                .map(|v| -v)
                .map_err(|_| invalid_number(token, field))
        }
        None => {
            let value = parse_unsigned(token, field)?;
            i64::try_from(value).map_err(|_| invalid_number(token, field))
        }
    }
}

pub(crate) fn parse_u32(token: &str, field: &'static str) -> Result<u32, DecodeError> {
    let value = parse_unsigned(token, field)?;
    u32::try_from(value).map_err(|_| invalid_number(token, field))
}

pub(crate) fn parse_i32(token: &str, field: &'static str) -> Result<i32, DecodeError> {
    let value = parse_signed(token, field)?;
    i32::try_from(value).map_err(|_| invalid_number(token, field))
}

fn parse_usize(token: &str, field: &'static str) -> Result<usize, DecodeError> {
    let value = parse_unsigned(token, field)?;
    usize::try_from(value).map_err(|_| invalid_number(token, field))
}

fn invalid_number(token: &str, field: &'static str) -> DecodeError {
    DecodeError::InvalidNumber {
        field,
        value: token.to_string(),
    }
}

/// Splits a byte stream into frames and decodes them.
///
/// Bytes are buffered until a terminator arrives, so a frame may span any
/// number of reads. An oversized frame is skipped up to its terminator and
/// reported once.
pub struct FrameDecoder {
    max_frame_len: usize,
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Reading,
    Discarding,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            state: DecodeState::Reading,
        }
    }

    /// Attempt to decode a packet from the buffer.
    /// Returns Ok(None) if more data is needed.
    ///
    /// After an error the buffer is positioned past the offending frame, so
    /// calling again continues with the next one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawPacket>, DecodeError> {
        loop {
            let terminator = buf.iter().position(|b| *b == FRAME_TERMINATOR);

            match self.state {
                DecodeState::Discarding => match terminator {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.state = DecodeState::Reading;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                },
                DecodeState::Reading => match terminator {
                    Some(pos) if pos > self.max_frame_len => {
                        buf.advance(pos + 1);
                        return Err(DecodeError::FrameTooLong(pos, self.max_frame_len));
                    }
                    Some(pos) => {
                        let frame = buf.split_to(pos);
                        buf.advance(1);
                        return decode(&frame).map(Some);
                    }
                    None if buf.len() > self.max_frame_len => {
                        let len = buf.len();
                        buf.clear();
                        self.state = DecodeState::Discarding;
                        return Err(DecodeError::FrameTooLong(len, self.max_frame_len));
                    }
                    None => return Ok(None),
                },
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
