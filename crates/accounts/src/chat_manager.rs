use std::sync::Arc;

use tracing::debug;
use waddle_xmpp::{ChatContext, Occupant};

use crate::{error::AccountError, manager::AccountManager};

/// Routes chat operations to the account they belong to.
#[derive(Clone)]
pub struct ChatManager {
    accounts: Arc<AccountManager>,
}

impl ChatManager {
    pub fn new(accounts: Arc<AccountManager>) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    /// The chat context of the connected account with address `jid`.
    pub fn get_chat_context_for_account(&self, jid: &str) -> Result<ChatContext, AccountError> {
        self.accounts
            .get_account_by_jid(jid)?
            .map(|session| session.chat().clone())
            .ok_or_else(|| AccountError::AccountNotConnected(jid.to_string()))
    }

    /// Join the room with the account named in `occupant`.
    pub async fn enter_room(&self, occupant: &Occupant) -> Result<(), AccountError> {
        let chat = self.get_chat_context_for_account(&occupant.account)?;
        debug!(account = %occupant.account, room = %occupant.room, "routing join");
        chat.enter_room(occupant).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tracing_test::traced_test;
    use waddle_test_support::xmpp::connection;
    use waddle_xmpp::{ChatError, ChatOptions, Jid};

    use super::*;
    use crate::session::AccountSession;

    #[tokio::test]
    async fn unknown_account_is_not_connected() {
        let chats = ChatManager::new(Arc::new(AccountManager::new(ChatOptions::default())));

        assert_matches!(
            chats.get_chat_context_for_account("nobody@example.org"),
            Err(AccountError::AccountNotConnected(jid)) if jid == "nobody@example.org"
        );
        assert_matches!(
            chats.get_chat_context_for_account("@example.org"),
            Err(AccountError::InvalidJid(_))
        );
    }

    #[tokio::test]
    async fn resolves_context_by_full_jid() {
        let accounts = Arc::new(AccountManager::new(ChatOptions::default()));
        let (conn, _peer) = connection("alice@example.org", None);
        accounts.register(AccountSession::new("work", "Alice", conn, ChatOptions::default()));
        let chats = ChatManager::new(accounts);

        let chat = chats
            .get_chat_context_for_account("alice@example.org/desktop")
            .unwrap();
        assert_eq!(chat.connection().jid().to_string(), "alice@example.org");
    }

    #[tokio::test]
    async fn shared_address_survives_one_account_leaving() {
        let accounts = Arc::new(AccountManager::new(ChatOptions::default()));
        let (work, _work_peer) = connection("alice@example.org", None);
        let (laptop, _laptop_peer) = connection("alice@example.org", None);
        accounts.register(AccountSession::new("work", "Alice", work, ChatOptions::default()));
        accounts.register(AccountSession::new("laptop", "Alice", laptop, ChatOptions::default()));
        let chats = ChatManager::new(Arc::clone(&accounts));

        accounts.disconnect("laptop");
        let chat = chats
            .get_chat_context_for_account("alice@example.org")
            .expect("work still uses the address");
        assert!(chat.connection().is_connected());
    }

    #[tokio::test]
    #[traced_test]
    async fn enter_room_routes_to_owning_account() {
        let accounts = Arc::new(AccountManager::new(ChatOptions::default()));
        let (alice, _alice_peer) = connection("alice@example.org", None);
        let (bob, mut bob_peer) = connection("bob@example.net", None);
        accounts.register(AccountSession::new("work", "Alice", alice, ChatOptions::default()));
        accounts.register(AccountSession::new("home", "Bob", bob, ChatOptions::default()));
        let chats = ChatManager::new(accounts);

        let server = tokio::spawn(async move {
            let request = bob_peer.next_request().await;
            assert_eq!(
                request.to().map(Jid::as_str),
                Some("lobby@conference.example.org/bob")
            );
            bob_peer
                .send(
                    "<presence xmlns='jabber:client' from='lobby@conference.example.org/bob'>\
                     <x xmlns='http://jabber.org/protocol/muc#user'><status code='110'/></x>\
                     </presence>",
                )
                .await;
            bob_peer
        });

        let occupant = Occupant::new("lobby@conference.example.org", "bob", "bob@example.net");
        chats.enter_room(&occupant).await.unwrap();
        let _bob_peer = server.await.unwrap();
        assert!(logs_contain("routing join"));
    }

    #[tokio::test]
    async fn closed_account_refuses_join() {
        let accounts = Arc::new(AccountManager::new(ChatOptions::default()));
        let (alice, _peer) = connection("alice@example.org", None);
        let session =
            accounts.register(AccountSession::new("work", "Alice", alice, ChatOptions::default()));
        let chats = ChatManager::new(accounts);
        let chat = chats.get_chat_context_for_account("alice@example.org").unwrap();

        session.connection().close();
        let occupant = Occupant::new("lobby@conference.example.org", "alice", "alice@example.org");
        assert_matches!(
            chats.enter_room(&occupant).await,
            Err(AccountError::AccountNotConnected(_))
        );
        assert_matches!(chat.enter_room(&occupant).await, Err(ChatError::NotConnected));
    }
}
