use waddle_xmpp::{BareJid, ChatContext, ChatOptions, Connection, ConnectionState, Jid};

use crate::error::AccountError;

pub type AccountId = String;

/// One connected account: its connection and the chat context derived from
/// it. Lives exactly as long as the connection is up.
#[derive(Debug)]
pub struct AccountSession {
    id: AccountId,
    display_name: String,
    chat: ChatContext,
}

impl AccountSession {
    pub fn new(
        id: impl Into<AccountId>,
        display_name: impl Into<String>,
        connection: Connection,
        options: ChatOptions,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            chat: ChatContext::new(connection, options),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn jid(&self) -> &BareJid {
        self.chat.connection().jid()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn connection(&self) -> &Connection {
        self.chat.connection()
    }

    pub fn chat(&self) -> &ChatContext {
        &self.chat
    }

    pub fn state(&self) -> ConnectionState {
        self.connection().state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }
}

/// Lookup key for an account address: resource dropped, case folded.
pub fn bare_key(jid: &str) -> Result<String, AccountError> {
    Jid::new(jid)
        .map(|jid| jid.to_bare().to_string().to_lowercase())
        .map_err(|error| AccountError::InvalidJid(format!("{jid}: {error}")))
}
