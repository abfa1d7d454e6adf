//! Type-agnostic packet value sitting between the codec and typed packets.

use super::Origin;

/// Message type codes understood by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    HandshakeResponse,
    ServerDataRequest,
    ServerInfo,
    WorldState,
    GameData,
    BattleData,
    Disconnect,
    /// A code this build does not know about
    Unknown(u32),
}

impl MessageType {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => MessageType::Handshake,
            2 => MessageType::HandshakeResponse,
            3 => MessageType::ServerDataRequest,
            4 => MessageType::ServerInfo,
            5 => MessageType::WorldState,
            6 => MessageType::GameData,
            7 => MessageType::BattleData,
            8 => MessageType::Disconnect,
            other => MessageType::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            MessageType::Handshake => 1,
            MessageType::HandshakeResponse => 2,
            MessageType::ServerDataRequest => 3,
            MessageType::ServerInfo => 4,
            MessageType::WorldState => 5,
            MessageType::GameData => 6,
            MessageType::BattleData => 7,
            MessageType::Disconnect => 8,
            MessageType::Unknown(code) => *code,
        }
    }
}

/// A decoded frame: version, message type code, origin and ordered fields.
///
/// The numeric code is stored as received so unknown codes survive a
/// decode/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    version: String,
    code: u32,
    origin: Origin,
    fields: Vec<String>,
}

impl RawPacket {
    pub fn new(
        version: impl Into<String>,
        message_type: MessageType,
        origin: Origin,
        fields: Vec<String>,
    ) -> Self {
        Self::with_code(version, message_type.code(), origin, fields)
    }

    pub fn with_code(
        version: impl Into<String>,
        code: u32,
        origin: Origin,
        fields: Vec<String>,
    ) -> Self {
        Self {
            version: version.into(),
            code,
            origin,
            fields,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_code(self.code)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Same packet re-addressed to another origin.
    pub fn with_origin(&self, origin: Origin) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }
}
