//! Typed packet definitions
//!
//! Each packet owns the layout of its field slots. Conversions go through
//! [`TypedPacket`], and [`Packet`] unifies them as a sum type for routing.

use super::codec::{parse_i32, parse_u32};
use super::{DecodeError, MessageType, Origin, RawPacket, PROTOCOL_VERSION};

/// Conversion between a typed packet and its raw form.
pub trait TypedPacket: Sized {
    const MESSAGE_TYPE: MessageType;
    const FIELD_COUNT: usize;

    fn write_fields(&self) -> Vec<String>;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError>;

    fn to_raw(&self, origin: Origin) -> RawPacket {
        RawPacket::new(PROTOCOL_VERSION, Self::MESSAGE_TYPE, origin, self.write_fields())
    }

    fn from_raw(raw: &RawPacket) -> Result<Self, DecodeError> {
        if raw.message_type() != Self::MESSAGE_TYPE {
            return Err(DecodeError::UnexpectedMessageType {
                expected: Self::MESSAGE_TYPE.code(),
                actual: raw.code(),
            });
        }
        let mut reader = FieldReader::new(raw.fields(), Self::FIELD_COUNT)?;
        Self::read_fields(&mut reader)
    }
}

/// Sequential access to a packet's fields with typed parsing.
pub struct FieldReader<'a> {
    fields: std::slice::Iter<'a, String>,
}

impl<'a> FieldReader<'a> {
    pub fn new(fields: &'a [String], expected: usize) -> Result<Self, DecodeError> {
        if fields.len() != expected {
            return Err(DecodeError::FieldCountMismatch {
                declared: expected,
                actual: fields.len(),
            });
        }
        Ok(Self {
            fields: fields.iter(),
        })
    }

    fn next_raw(&mut self) -> &'a str {
        // Length was checked against the packet's field count up front.
        self.fields.next().map(String::as_str).unwrap_or_default()
    }

    pub fn string(&mut self) -> String {
        self.next_raw().to_string()
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        parse_u32(self.next_raw(), field)
    }

    pub fn origin(&mut self, field: &'static str) -> Result<Origin, DecodeError> {
        parse_i32(self.next_raw(), field).map(Origin::from_int)
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.next_raw() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(DecodeError::InvalidBool {
                field,
                value: other.to_string(),
            }),
        }
    }

    pub fn list(&mut self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        decode_list(self.next_raw(), field)
    }
}

/// Pack several values into one slot as `<byte length>:<value>` items.
pub fn encode_list<S: AsRef<str>>(items: &[S]) -> String {
    let mut out = String::new();
    for item in items {
        let item = item.as_ref();
        out.push_str(&item.len().to_string());
        out.push(':');
        out.push_str(item);
    }
    out
}

/// Inverse of [`encode_list`].
pub fn decode_list(slot: &str, field: &'static str) -> Result<Vec<String>, DecodeError> {
    let malformed = || DecodeError::MalformedList { field };
    let mut items = Vec::new();
    let mut rest = slot;

    while !rest.is_empty() {
        let (len, tail) = rest.split_once(':').ok_or_else(malformed)?;
        let len: usize = parse_u32(len, field).map_err(|_| malformed())? as usize;
        if !tail.is_char_boundary(len.min(tail.len())) || tail.len() < len {
            return Err(malformed());
        }
        let (item, remaining) = tail.split_at(len);
        items.push(item.to_string());
        rest = remaining;
    }

    Ok(items)
}

fn bool_field(value: bool) -> String {
    let flag = if value { "1" } else { "0" };
    flag.to_string()
}

/// Client greeting, first packet on a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub player_name: String,
}

impl TypedPacket for Handshake {
    const MESSAGE_TYPE: MessageType = MessageType::Handshake;
    const FIELD_COUNT: usize = 1;

    fn write_fields(&self) -> Vec<String> {
        vec![self.player_name.clone()]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            player_name: fields.string(),
        })
    }
}

/// Server answer to a [`Handshake`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub accepted: bool,
    /// Session id assigned to the player, `NEW_PLAYER` when rejected
    pub assigned: Origin,
    pub reason: String,
}

impl TypedPacket for HandshakeResponse {
    const MESSAGE_TYPE: MessageType = MessageType::HandshakeResponse;
    const FIELD_COUNT: usize = 3;

    fn write_fields(&self) -> Vec<String> {
        vec![
            bool_field(self.accepted),
            self.assigned.to_int().to_string(),
            self.reason.clone(),
        ]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            accepted: fields.bool("accepted")?,
            assigned: fields.origin("assigned")?,
            reason: fields.string(),
        })
    }
}

/// Request for a [`ServerInfo`] reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDataRequest;

impl TypedPacket for ServerDataRequest {
    const MESSAGE_TYPE: MessageType = MessageType::ServerDataRequest;
    const FIELD_COUNT: usize = 0;

    fn write_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn read_fields(_fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

/// Public server description and who is online
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub player_count: u32,
    pub max_size: u32,
    pub name: String,
    pub description: String,
    pub players: Vec<String>,
}

impl TypedPacket for ServerInfo {
    const MESSAGE_TYPE: MessageType = MessageType::ServerInfo;
    const FIELD_COUNT: usize = 5;

    fn write_fields(&self) -> Vec<String> {
        vec![
            self.player_count.to_string(),
            self.max_size.to_string(),
            self.name.clone(),
            self.description.clone(),
            encode_list(&self.players),
        ]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            player_count: fields.u32("player count")?,
            max_size: fields.u32("max size")?,
            name: fields.string(),
            description: fields.string(),
            players: fields.list("players")?,
        })
    }
}

/// Shared world clock and conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldState {
    pub time: String,
    pub weather: String,
    pub season: String,
}

impl TypedPacket for WorldState {
    const MESSAGE_TYPE: MessageType = MessageType::WorldState;
    const FIELD_COUNT: usize = 3;

    fn write_fields(&self) -> Vec<String> {
        vec![self.time.clone(), self.weather.clone(), self.season.clone()]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            time: fields.string(),
            weather: fields.string(),
            season: fields.string(),
        })
    }
}

/// Player game-data update (position, sprite, status...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameData {
    pub player: Origin,
    pub kind: String,
    pub payload: String,
}

impl TypedPacket for GameData {
    const MESSAGE_TYPE: MessageType = MessageType::GameData;
    const FIELD_COUNT: usize = 3;

    fn write_fields(&self) -> Vec<String> {
        vec![
            self.player.to_int().to_string(),
            self.kind.clone(),
            self.payload.clone(),
        ]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            player: fields.origin("player")?,
            kind: fields.string(),
            payload: fields.string(),
        })
    }
}

/// Battle data exchanged between two players
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleData {
    pub partner: Origin,
    pub payload: String,
}

impl TypedPacket for BattleData {
    const MESSAGE_TYPE: MessageType = MessageType::BattleData;
    const FIELD_COUNT: usize = 2;

    fn write_fields(&self) -> Vec<String> {
        vec![self.partner.to_int().to_string(), self.payload.clone()]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            partner: fields.origin("partner")?,
            payload: fields.string(),
        })
    }
}

/// Graceful disconnect or kick notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

impl TypedPacket for Disconnect {
    const MESSAGE_TYPE: MessageType = MessageType::Disconnect;
    const FIELD_COUNT: usize = 1;

    fn write_fields(&self) -> Vec<String> {
        vec![self.reason.clone()]
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            reason: fields.string(),
        })
    }
}

/// All packets this server understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    ServerDataRequest(ServerDataRequest),
    ServerInfo(ServerInfo),
    WorldState(WorldState),
    GameData(GameData),
    BattleData(BattleData),
    Disconnect(Disconnect),
    /// Well-formed frame with a code this build does not know
    Unknown(RawPacket),
}

impl Packet {
    pub fn from_raw(raw: &RawPacket) -> Result<Self, DecodeError> {
        let packet = match raw.message_type() {
            MessageType::Handshake => Packet::Handshake(Handshake::from_raw(raw)?),
            MessageType::HandshakeResponse => {
                Packet::HandshakeResponse(HandshakeResponse::from_raw(raw)?)
            }
            MessageType::ServerDataRequest => {
                Packet::ServerDataRequest(ServerDataRequest::from_raw(raw)?)
            }
            MessageType::ServerInfo => Packet::ServerInfo(ServerInfo::from_raw(raw)?),
            MessageType::WorldState => Packet::WorldState(WorldState::from_raw(raw)?),
            MessageType::GameData => Packet::GameData(GameData::from_raw(raw)?),
            MessageType::BattleData => Packet::BattleData(BattleData::from_raw(raw)?),
            MessageType::Disconnect => Packet::Disconnect(Disconnect::from_raw(raw)?),
            MessageType::Unknown(_) => Packet::Unknown(raw.clone()),
        };
        Ok(packet)
    }

    pub fn to_raw(&self, origin: Origin) -> RawPacket {
        match self {
            Packet::Handshake(p) => p.to_raw(origin),
            Packet::HandshakeResponse(p) => p.to_raw(origin),
            Packet::ServerDataRequest(p) => p.to_raw(origin),
            Packet::ServerInfo(p) => p.to_raw(origin),
            Packet::WorldState(p) => p.to_raw(origin),
            Packet::GameData(p) => p.to_raw(origin),
            Packet::BattleData(p) => p.to_raw(origin),
            Packet::Disconnect(p) => p.to_raw(origin),
            Packet::Unknown(raw) => raw.with_origin(origin),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Handshake(_) => MessageType::Handshake,
            Packet::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Packet::ServerDataRequest(_) => MessageType::ServerDataRequest,
            Packet::ServerInfo(_) => MessageType::ServerInfo,
            Packet::WorldState(_) => MessageType::WorldState,
            Packet::GameData(_) => MessageType::GameData,
            Packet::BattleData(_) => MessageType::BattleData,
            Packet::Disconnect(_) => MessageType::Disconnect,
            Packet::Unknown(raw) => raw.message_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode};

    #[test]
    fn test_server_info_over_the_wire() {
        let info = ServerInfo {
            player_count: 2,
            max_size: 20,
            name: "Test Server".to_string(),
            description: String::new(),
            players: vec!["Alice".to_string(), "Bob".to_string()],
        };

        let frame = encode(&info.to_raw(Origin::SERVER));
        assert_eq!(frame, b"1.0|4|-1|5|2|20|Test Server||5:Alice3:Bob".to_vec());

        let raw = decode(&frame).unwrap();
        match Packet::from_raw(&raw).unwrap() {
            Packet::ServerInfo(decoded) => {
                assert_eq!(decoded.player_count, 2);
                assert_eq!(decoded.max_size, 20);
                assert_eq!(decoded.name, "Test Server");
                assert_eq!(decoded.description, "");
                assert_eq!(decoded.players, vec!["Alice", "Bob"]);
            }
            other => panic!("Wrong packet: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_count_is_a_decode_error() {
        let raw = RawPacket::new(
            PROTOCOL_VERSION,
            MessageType::BattleData,
            Origin::from_int(1),
            vec!["2".to_string()],
        );
        assert_eq!(
            Packet::from_raw(&raw).unwrap_err(),
            DecodeError::FieldCountMismatch {
                declared: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_non_numeric_origin_field() {
        let raw = RawPacket::new(
            PROTOCOL_VERSION,
            MessageType::BattleData,
            Origin::from_int(1),
            vec!["partner".to_string(), "move:1".to_string()],
        );
        assert!(matches!(
            BattleData::from_raw(&raw),
            Err(DecodeError::InvalidNumber { field: "partner", .. })
        ));
    }

    #[test]
    fn test_from_raw_checks_message_type() {
        let raw = Disconnect {
            reason: "bye".to_string(),
        }
        .to_raw(Origin::SERVER);
        assert_eq!(
            Handshake::from_raw(&raw).unwrap_err(),
            DecodeError::UnexpectedMessageType {
                expected: 1,
                actual: 8
            }
        );
    }

    #[test]
    fn test_battle_partner_is_an_origin() {
        let packet = Packet::BattleData(BattleData {
            partner: Origin::from_int(9),
            payload: "attack|2".to_string(),
        });
        let raw = packet.to_raw(Origin::from_int(4));
        assert_eq!(raw.fields()[0], "9");
        assert_eq!(Packet::from_raw(&decode(&encode(&raw)).unwrap()).unwrap(), packet);
    }

    #[test]
    fn test_unknown_packets_pass_through() {
        let raw = RawPacket::with_code("1.0", 77, Origin::from_int(3), vec!["x".to_string()]);
        let packet = Packet::from_raw(&raw).unwrap();
        assert_eq!(packet.message_type(), MessageType::Unknown(77));
        assert_eq!(packet.to_raw(Origin::from_int(3)), raw);
    }

    #[test]
    fn test_list_sub_framing() {
        let items = vec!["a:b".to_string(), String::new(), "élan".to_string()];
        let slot = encode_list(&items);
        assert_eq!(slot, "3:a:b0:5:élan");
        assert_eq!(decode_list(&slot, "players").unwrap(), items);
        assert_eq!(decode_list("", "players").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_malformed_lists() {
        for slot in ["5:Ali", "x:abc", "3abc", "1:\u{e9}"] {
            assert_eq!(
                decode_list(slot, "players").unwrap_err(),
                DecodeError::MalformedList { field: "players" },
                "accepted {:?}",
                slot
            );
        }
    }

    #[test]
    fn test_handshake_response_bool_field() {
        let raw = RawPacket::new(
            PROTOCOL_VERSION,
            MessageType::HandshakeResponse,
            Origin::SERVER,
            vec!["yes".to_string(), "3".to_string(), String::new()],
        );
        assert!(matches!(
            HandshakeResponse::from_raw(&raw),
            Err(DecodeError::InvalidBool { field: "accepted", .. })
        ));
    }
}
