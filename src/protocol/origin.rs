//! Sender/target identity carried by every frame.

use std::fmt;

/// Identifies the logical sender or target of a packet.
///
/// `-1` is the server itself, `0` a connection that has not been assigned an
/// id yet, and any positive value the player session with that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin(i32);

impl Origin {
    pub const SERVER: Origin = Origin(-1);
    pub const NEW_PLAYER: Origin = Origin(0);

    pub const fn from_int(value: i32) -> Self {
        Self(value)
    }

    pub const fn to_int(self) -> i32 {
        self.0
    }

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }

    pub fn is_new_player(self) -> bool {
        self == Self::NEW_PLAYER
    }

    /// Session id of a connected player, if this origin names one.
    pub fn player_id(self) -> Option<u32> {
        if self.0 > 0 {
            Some(self.0 as u32)
        } else {
            None
        }
    }
}

impl From<i32> for Origin {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Origin> for i32 {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            -1 => write!(f, "server"),
            0 => write!(f, "new-player"),
            n => write!(f, "player#{}", n),
        }
    }
}
