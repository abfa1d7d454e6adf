//! Default handlers for the packets a game server answers itself.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::dispatch::{
    Notification, NotificationHandler, PostProcessor, PreProcessor, Query, QueryHandler, Request,
    RequestHandler,
};
use crate::network::{SessionRegistry, SERVER_FULL_REASON};
use crate::protocol::{
    BattleData, GameData, HandshakeResponse, Origin, RawPacket, ServerInfo, TypedPacket,
    PROTOCOL_VERSION,
};

/// Why a player could not join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    Full,
    NameTaken,
    InvalidName,
}

impl std::fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRejection::Full => write!(f, "{}", SERVER_FULL_REASON),
            JoinRejection::NameTaken => write!(f, "name already in use"),
            JoinRejection::InvalidName => write!(f, "invalid player name"),
        }
    }
}

/// Players that completed the handshake, ordered by origin
#[derive(Clone, Debug)]
pub struct Roster {
    players: Arc<RwLock<BTreeMap<Origin, String>>>,
    capacity: usize,
}

impl Roster {
    pub fn new(capacity: usize) -> Self {
        Self {
            players: Arc::new(RwLock::new(BTreeMap::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register `origin` under `name`. Logging in again renames the player.
    pub async fn join(&self, origin: Origin, name: &str) -> Result<(), JoinRejection> {
        let name = name.trim();
        if name.is_empty() || name.chars().any(char::is_control) {
            return Err(JoinRejection::InvalidName);
        }

        let mut players = self.players.write().await;
        let taken = players
            .iter()
            .any(|(other, existing)| *other != origin && existing.eq_ignore_ascii_case(name));
        if taken {
            return Err(JoinRejection::NameTaken);
        }
        if !players.contains_key(&origin) && players.len() >= self.capacity {
            return Err(JoinRejection::Full);
        }

        players.insert(origin, name.to_string());
        Ok(())
    }

    pub async fn leave(&self, origin: Origin) -> Option<String> {
        self.players.write().await.remove(&origin)
    }

    pub async fn contains(&self, origin: Origin) -> bool {
        self.players.read().await.contains_key(&origin)
    }

    pub async fn name_of(&self, origin: Origin) -> Option<String> {
        self.players.read().await.get(&origin).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.players.read().await.values().cloned().collect()
    }

    pub async fn origins(&self) -> Vec<Origin> {
        self.players.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.players.read().await.len()
    }
}

/// Send `packet` to every joined player except `except`; returns deliveries.
/// Never waits on a slow player: see [`SessionRegistry::send_to`].
pub async fn send_to_players(
    roster: &Roster,
    sessions: &SessionRegistry,
    packet: &RawPacket,
    except: Option<Origin>,
) -> usize {
    let mut delivered = 0;
    for origin in roster.origins().await {
        if Some(origin) == except {
            continue;
        }
        match sessions.send_to(origin, packet).await {
            Ok(()) => delivered += 1,
            Err(e) => debug!("Could not deliver to {}: {}", origin, e),
        }
    }
    delivered
}

/// A connection asks to join under a player name
#[derive(Debug, Clone)]
pub struct Login {
    pub origin: Origin,
    pub version: String,
    pub player_name: String,
}

impl Request for Login {
    type Response = HandshakeResponse;
}

/// Forward battle data to the sender's partner
#[derive(Debug, Clone)]
pub struct RelayBattleData {
    pub from: Origin,
    pub partner: Origin,
    pub payload: String,
}

impl Request for RelayBattleData {
    type Response = ();
}

/// Snapshot of the server for listings
#[derive(Debug, Clone, Copy)]
pub struct ServerInfoQuery;

impl Query for ServerInfoQuery {
    type Output = ServerInfo;
}

/// A player published new game data
#[derive(Debug, Clone)]
pub struct PlayerDataUpdated {
    pub origin: Origin,
    pub kind: String,
    pub payload: String,
}

impl Notification for PlayerDataUpdated {}

/// A session ended
#[derive(Debug, Clone)]
pub struct PlayerLeft {
    pub origin: Origin,
    pub reason: String,
}

impl Notification for PlayerLeft {}

pub struct LoginHandler {
    roster: Roster,
}

impl LoginHandler {
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl RequestHandler<Login> for LoginHandler {
    async fn handle(&self, login: &Login, _cancel: &CancellationToken) -> anyhow::Result<HandshakeResponse> {
        if login.version != PROTOCOL_VERSION {
            return Ok(HandshakeResponse {
                accepted: false,
                assigned: Origin::NEW_PLAYER,
                reason: format!("unsupported protocol version {}", login.version),
            });
        }

        let response = match self.roster.join(login.origin, &login.player_name).await {
            Ok(()) => HandshakeResponse {
                accepted: true,
                assigned: login.origin,
                reason: String::new(),
            },
            Err(rejection) => HandshakeResponse {
                accepted: false,
                assigned: Origin::NEW_PLAYER,
                reason: rejection.to_string(),
            },
        };
        Ok(response)
    }
}

/// Logs accepted logins
pub struct JoinAnnouncer;

#[async_trait]
impl PostProcessor<Login> for JoinAnnouncer {
    async fn process(
        &self,
        login: &Login,
        response: &HandshakeResponse,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if response.accepted {
            info!("{} joined as {}", login.player_name.trim(), login.origin);
        } else {
            info!("Login for {} refused: {}", login.origin, response.reason);
        }
        Ok(())
    }
}

/// Refuses battle data for partners that are not playing
pub struct PartnerOnline {
    roster: Roster,
}

impl PartnerOnline {
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl PreProcessor<RelayBattleData> for PartnerOnline {
    async fn process(&self, relay: &RelayBattleData, _cancel: &CancellationToken) -> anyhow::Result<()> {
        anyhow::ensure!(relay.partner != relay.from, "{} cannot battle itself", relay.from);
        anyhow::ensure!(
            self.roster.contains(relay.partner).await,
            "battle partner {} is not online",
            relay.partner
        );
        Ok(())
    }
}

pub struct BattleRelay {
    sessions: SessionRegistry,
}

impl BattleRelay {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl RequestHandler<RelayBattleData> for BattleRelay {
    async fn handle(&self, relay: &RelayBattleData, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let packet = BattleData {
            partner: relay.from,
            payload: relay.payload.clone(),
        }
        .to_raw(relay.from);

        self.sessions
            .send_to(relay.partner, &packet)
            .await
            .with_context(|| format!("relaying battle data to {}", relay.partner))
    }
}

pub struct ServerInfoHandler {
    roster: Roster,
    name: String,
    description: String,
}

impl ServerInfoHandler {
    pub fn new(roster: Roster, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            roster,
            name: name.into(),
            description: description.into(),
        }
    }
}

#[async_trait]
impl QueryHandler<ServerInfoQuery> for ServerInfoHandler {
    async fn handle(&self, _query: &ServerInfoQuery, _cancel: &CancellationToken) -> anyhow::Result<ServerInfo> {
        let players = self.roster.names().await;
        Ok(ServerInfo {
            player_count: u32::try_from(players.len())?,
            max_size: u32::try_from(self.roster.capacity())?,
            name: self.name.clone(),
            description: self.description.clone(),
            players,
        })
    }
}

/// Fans a player's game data out to everyone else
pub struct GameDataRelay {
    roster: Roster,
    sessions: SessionRegistry,
}

impl GameDataRelay {
    pub fn new(roster: Roster, sessions: SessionRegistry) -> Self {
        Self { roster, sessions }
    }
}

#[async_trait]
impl NotificationHandler<PlayerDataUpdated> for GameDataRelay {
    async fn handle(&self, update: &PlayerDataUpdated, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let packet = GameData {
            player: update.origin,
            kind: update.kind.clone(),
            payload: update.payload.clone(),
        }
        .to_raw(update.origin);

        let delivered = send_to_players(&self.roster, &self.sessions, &packet, Some(update.origin)).await;
        debug!("Game data from {} delivered to {} players", update.origin, delivered);
        Ok(())
    }
}

pub struct RosterCleanup {
    roster: Roster,
}

impl RosterCleanup {
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl NotificationHandler<PlayerLeft> for RosterCleanup {
    async fn handle(&self, left: &PlayerLeft, _cancel: &CancellationToken) -> anyhow::Result<()> {
        if let Some(name) = self.roster.leave(left.origin).await {
            info!("{} ({}) left: {}", name, left.origin, left.reason);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(id: i32, name: &str) -> Login {
        Login {
            origin: Origin::from_int(id),
            version: PROTOCOL_VERSION.to_string(),
            player_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_roster_rules() {
        let roster = Roster::new(2);
        assert_eq!(roster.join(Origin::from_int(1), "Alice").await, Ok(()));
        assert_eq!(
            roster.join(Origin::from_int(2), "alice").await,
            Err(JoinRejection::NameTaken)
        );
        assert_eq!(
            roster.join(Origin::from_int(2), "  ").await,
            Err(JoinRejection::InvalidName)
        );
        assert_eq!(roster.join(Origin::from_int(2), "Bob").await, Ok(()));
        assert_eq!(
            roster.join(Origin::from_int(3), "Carol").await,
            Err(JoinRejection::Full)
        );

        // Renaming an existing player does not count against capacity
        assert_eq!(roster.join(Origin::from_int(2), "Robert").await, Ok(()));
        assert_eq!(roster.names().await, vec!["Alice", "Robert"]);

        assert_eq!(roster.leave(Origin::from_int(1)).await.as_deref(), Some("Alice"));
        assert_eq!(roster.len().await, 1);
    }

    #[tokio::test]
    async fn test_login_handler_responses() {
        let roster = Roster::new(4);
        let handler = LoginHandler::new(roster.clone());
        let cancel = CancellationToken::new();

        let accepted = handler.handle(&login(3, "Alice"), &cancel).await.unwrap();
        assert!(accepted.accepted);
        assert_eq!(accepted.assigned, Origin::from_int(3));

        let duplicate = handler.handle(&login(4, "ALICE"), &cancel).await.unwrap();
        assert!(!duplicate.accepted);
        assert_eq!(duplicate.reason, "name already in use");

        let mut old_client = login(5, "Bob");
        old_client.version = "0.9".to_string();
        let outdated = handler.handle(&old_client, &cancel).await.unwrap();
        assert!(!outdated.accepted);
        assert_eq!(outdated.reason, "unsupported protocol version 0.9");
        assert!(!roster.contains(Origin::from_int(5)).await);
    }

    #[tokio::test]
    async fn test_partner_must_be_online() {
        let roster = Roster::new(4);
        roster.join(Origin::from_int(1), "Alice").await.unwrap();
        let check = PartnerOnline::new(roster.clone());
        let cancel = CancellationToken::new();

        let relay = |partner: i32| RelayBattleData {
            from: Origin::from_int(1),
            partner: Origin::from_int(partner),
            payload: "attack".to_string(),
        };

        let err = check.process(&relay(2), &cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "battle partner player#2 is not online");
        assert!(check.process(&relay(1), &cancel).await.is_err());

        roster.join(Origin::from_int(2), "Bob").await.unwrap();
        assert!(check.process(&relay(2), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_info_lists_players() {
        let roster = Roster::new(20);
        roster.join(Origin::from_int(2), "Bob").await.unwrap();
        roster.join(Origin::from_int(1), "Alice").await.unwrap();

        let handler = ServerInfoHandler::new(roster, "Test Server", "");
        let info = handler
            .handle(&ServerInfoQuery, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(info.player_count, 2);
        assert_eq!(info.max_size, 20);
        assert_eq!(info.players, vec!["Alice", "Bob"]);
        assert_eq!(
            info.to_raw(Origin::SERVER).fields(),
            &["2", "20", "Test Server", "", "5:Alice3:Bob"]
        );
    }
}
