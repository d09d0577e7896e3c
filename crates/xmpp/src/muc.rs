use tracing::debug;
use xmpp_parsers::{
    jid::{BareJid, Jid},
    minidom::Element,
    muc::{
        Muc,
        muc::History,
        user::{MucUser, Status},
    },
    ns,
    presence::{Presence, Type as PresenceType},
};

use crate::{error::ChatError, stanza::Stanza};

pub const MUC_NS: &str = ns::MUC;

const SELF_PRESENCE_CODE: &str = "110";

/// A request to occupy a room under a nickname, on behalf of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    /// Bare room address, `room@service`.
    pub room: String,
    pub nickname: String,
    /// Bare JID of the account that should join.
    pub account: String,
    pub password: Option<String>,
    /// Upper bound on discussion history the room should replay.
    pub max_history: Option<u32>,
}

impl Occupant {
    pub fn new(
        room: impl Into<String>,
        nickname: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            room: room.into(),
            nickname: nickname.into(),
            account: account.into(),
            password: None,
            max_history: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_max_history(mut self, stanzas: u32) -> Self {
        self.max_history = Some(stanzas);
        self
    }

    /// `room@service/nickname`, validated.
    pub fn occupant_jid(&self) -> Result<Jid, ChatError> {
        occupant_jid(&self.room, &self.nickname)
    }
}

pub(crate) fn occupant_jid(room: &str, nickname: &str) -> Result<Jid, ChatError> {
    if nickname.trim().is_empty() {
        return Err(ChatError::InvalidJid(format!("empty nickname for {room}")));
    }
    let room = BareJid::new(room).map_err(|error| ChatError::InvalidJid(format!("{room}: {error}")))?;
    if room.node().is_none() {
        return Err(ChatError::InvalidJid(format!("{room} is not a room address")));
    }
    Jid::new(&format!("{room}/{nickname}"))
        .map_err(|error| ChatError::InvalidJid(format!("{room}/{nickname}: {error}")))
}

/// Directed presence that asks the room to admit us.
pub fn build_join_presence(occupant: &Occupant, id: &str) -> Result<Presence, ChatError> {
    let to = occupant.occupant_jid()?;

    let mut muc = Muc::new();
    if let Some(password) = &occupant.password {
        muc = muc.with_password(password.clone());
    }
    if let Some(max_stanzas) = occupant.max_history {
        muc = muc.with_history(History::new().with_maxstanzas(max_stanzas));
    }

    Ok(Presence::available()
        .with_to(to)
        .with_id(id.to_string())
        .with_payload(muc))
}

pub fn build_leave_presence(room: &str, nickname: &str) -> Result<Presence, ChatError> {
    let to = occupant_jid(room, nickname)?;
    Ok(Presence::unavailable().with_to(to))
}

/// Whether the presence carries the MUC "this is you" status code.
pub fn has_self_status(presence: &Presence) -> bool {
    presence
        .payloads
        .iter()
        .filter(|payload| payload.is("x", ns::MUC_USER))
        .any(|x| match MucUser::try_from(x.clone()) {
            Ok(user) => user.status.contains(&Status::SelfPresence),
            Err(error) => {
                // Rooms add status codes newer than the parser knows about.
                debug!(%error, "reading muc#user payload leniently");
                has_raw_self_status(x)
            }
        })
}

fn has_raw_self_status(x: &Element) -> bool {
    x.children().any(|status| {
        status.is("status", ns::MUC_USER) && status.attr("code") == Some(SELF_PRESENCE_CODE)
    })
}

/// Interpret the presence that answered a join.
pub fn join_outcome(reply: &Stanza) -> Result<(), ChatError> {
    let Stanza::Presence(presence) = reply else {
        return Err(ChatError::MalformedReply(format!(
            "expected presence in answer to a join, got <{}/>",
            reply.name()
        )));
    };
    if let Some(error) = reply.error() {
        return Err(join_error(&error.condition, error.code.as_deref(), error.text));
    }
    if presence.type_ == PresenceType::Unavailable {
        return Err(ChatError::protocol(
            "unavailable",
            Some("room removed us while joining".to_string()),
        ));
    }
    Ok(())
}

fn join_error(condition: &str, code: Option<&str>, text: Option<String>) -> ChatError {
    match (condition, code) {
        ("conflict", _) | (_, Some("409")) => ChatError::NicknameConflict,
        ("forbidden", _) | (_, Some("403")) => ChatError::Forbidden,
        ("registration-required", _) | (_, Some("407")) => ChatError::RegistrationRequired,
        ("not-authorized", _) | (_, Some("401")) => ChatError::PasswordRequired,
        _ => ChatError::protocol(condition, text),
    }
}
