use std::time::Duration;

use tracing::{debug, info, instrument};
use uuid::Uuid;
use waddle_core::{config::DiscoveryConfig, event::EventPayload};
use xmpp_parsers::{iq::Iq, jid::Jid};

use crate::{
    connection::Connection,
    disco::{self, DiscoInfo, RoomItem},
    error::ChatError,
    muc::{self, MUC_NS, Occupant},
    pending::{PendingKey, ReplyMatcher, room_key},
    room_info::RoomInfo,
    stanza::Stanza,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatOptions {
    pub request_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for ChatOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            join_timeout: config.join_timeout(),
        }
    }
}

/// Room discovery and MUC entry over one account's connection.
///
/// Every operation fails with [`ChatError::NotConnected`] once the
/// connection is gone, without writing anything.
#[derive(Debug, Clone)]
pub struct ChatContext {
    connection: Connection,
    options: ChatOptions,
}

impl ChatContext {
    pub fn new(connection: Connection, options: ChatOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn options(&self) -> ChatOptions {
        self.options
    }

    /// Whether `service` hosts multi-user chat. Any failure counts as "no".
    #[instrument(skip(self), fields(account = %self.connection.jid()))]
    pub async fn check_for_support(&self, service: &str) -> bool {
        match self.disco_info(service).await {
            Ok(info) => info.has_feature(MUC_NS),
            Err(error) => {
                debug!(%error, "treating service as unsupported");
                false
            }
        }
    }

    /// List the rooms `service` advertises, in the order it sent them.
    #[instrument(skip(self), fields(account = %self.connection.jid()))]
    pub async fn query_rooms(&self, service: &str) -> Result<Vec<RoomItem>, ChatError> {
        let reply = self.request(service, disco::build_items_query).await?;
        let rooms = disco::parse_items_result(&reply)?;
        debug!(count = rooms.len(), "rooms listed");
        Ok(rooms)
    }

    #[instrument(skip(self), fields(account = %self.connection.jid()))]
    pub async fn query_room_information(&self, room: &str) -> Result<RoomInfo, ChatError> {
        let info = self.disco_info(room).await?;
        Ok(RoomInfo::from_disco(room, &info))
    }

    /// Join a room and wait until the room confirms or refuses us.
    #[instrument(
        skip(self, occupant),
        fields(
            account = %self.connection.jid(),
            room = %occupant.room,
            nick = %occupant.nickname,
        )
    )]
    pub async fn enter_room(&self, occupant: &Occupant) -> Result<(), ChatError> {
        let outcome = self.join(occupant).await;

        let account = self.connection.jid().to_string();
        match &outcome {
            Ok(()) => {
                info!("joined room");
                self.connection.emit(
                    "xmpp.muc.joined",
                    EventPayload::MucJoined {
                        account,
                        room: occupant.room.clone(),
                        nick: occupant.nickname.clone(),
                    },
                );
            }
            Err(error) => {
                info!(%error, "join refused");
                self.connection.emit(
                    "xmpp.muc.join.failed",
                    EventPayload::MucJoinFailed {
                        account,
                        room: occupant.room.clone(),
                        nick: occupant.nickname.clone(),
                        reason: error.to_string(),
                    },
                );
            }
        }
        outcome
    }

    /// Leave a room. Does not wait for the room to acknowledge.
    #[instrument(skip(self), fields(account = %self.connection.jid()))]
    pub async fn leave_room(&self, room: &str, nickname: &str) -> Result<(), ChatError> {
        let presence = muc::build_leave_presence(room, nickname)?;
        self.connection.send(presence).await
    }

    async fn join(&self, occupant: &Occupant) -> Result<(), ChatError> {
        let occupant_jid = occupant.occupant_jid()?;
        let reply = self.connection.register(
            PendingKey::Join(room_key(&occupant_jid)),
            ReplyMatcher::Occupant { occupant_jid },
        )?;
        let id = Uuid::new_v4().to_string();
        self.connection
            .send(muc::build_join_presence(occupant, &id)?)
            .await?;

        let presence = reply.wait(self.options.join_timeout).await?;
        muc::join_outcome(&presence)
    }

    async fn disco_info(&self, target: &str) -> Result<DiscoInfo, ChatError> {
        let reply = self.request(target, disco::build_info_query).await?;
        disco::parse_info_result(&reply)
    }

    /// Send an iq built by `build(id, to)` and wait for the matching reply.
    async fn request(&self, to: &str, build: fn(&str, Jid) -> Iq) -> Result<Stanza, ChatError> {
        let target =
            Jid::new(to).map_err(|error| ChatError::InvalidJid(format!("{to}: {error}")))?;
        let own_server = target.node().is_none()
            && target.resource().is_none()
            && target.domain() == self.connection.jid().domain();

        let id = Uuid::new_v4().to_string();
        let reply = self.connection.register(
            PendingKey::Iq(id.clone()),
            ReplyMatcher::From {
                jid: target.clone(),
                allow_missing: own_server,
            },
        )?;
        self.connection.send(build(&id, target)).await?;

        reply.wait(self.options.request_timeout).await
    }
}
