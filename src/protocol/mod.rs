//! Protocol module - Defines the line-oriented wire protocol
//!
//! Every frame is one line of `|`-separated tokens:
//!
//! ```text
//! version|messageTypeCode|originCode|fieldCount|field_1|...|field_fieldCount
//! ```
//!
//! Delimiters inside tokens are backslash-escaped by the codec. Typed packets
//! own the meaning of their field slots and any sub-framing inside a slot.

mod codec;
mod message;
mod origin;
mod raw;

pub use codec::*;
pub use message::*;
pub use origin::Origin;
pub use raw::{MessageType, RawPacket};

/// Protocol version token written into every outgoing frame
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default port for game connections
pub const DEFAULT_PORT: u16 = 7777;

/// Separates tokens inside a frame
pub const FIELD_DELIMITER: char = '|';

/// Terminates a frame on the byte stream
pub const FRAME_TERMINATOR: u8 = b'\n';
