use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use tracing::{debug, info, warn};
use waddle_core::{
    config::{AccountConfig, Config},
    event::{EventBus, EventPayload, EventSource, publish_best_effort},
};
use waddle_xmpp::{
    BareJid, ChatOptions, Connection, ConnectionConfig, ConnectionState, XmppTransport,
};

use crate::{
    error::AccountError,
    session::{AccountSession, bare_key},
};

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Arc<AccountSession>>,
    /// Bare JID key -> ids of the accounts using it, latest registration last.
    by_jid: HashMap<String, Vec<String>>,
    connecting: HashSet<String>,
}

impl Registry {
    /// Remove `id` if it still maps to `session` (any session when `None`).
    fn remove(
        &mut self,
        id: &str,
        session: Option<&Arc<AccountSession>>,
    ) -> Option<Arc<AccountSession>> {
        let current = self.by_id.get(id)?;
        if session.is_some_and(|session| !Arc::ptr_eq(current, session)) {
            return None;
        }
        let removed = self.by_id.remove(id)?;
        let key = jid_key(&removed);
        if let Some(ids) = self.by_jid.get_mut(&key) {
            ids.retain(|owner| owner != id);
            if ids.is_empty() {
                self.by_jid.remove(&key);
            }
        }
        Some(removed)
    }

    fn insert(&mut self, session: Arc<AccountSession>) {
        let id = session.id().to_string();
        self.by_jid
            .entry(jid_key(&session))
            .or_default()
            .push(id.clone());
        self.by_id.insert(id, session);
    }
}

/// Marks an account as connecting until dropped, so an abandoned `connect`
/// future cannot leave it stuck in `Connecting`.
struct ConnectingGuard {
    registry: Arc<RwLock<Registry>>,
    id: String,
}

impl ConnectingGuard {
    fn new(registry: &Arc<RwLock<Registry>>, id: &str) -> Self {
        registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connecting
            .insert(id.to_string());
        Self {
            registry: Arc::clone(registry),
            id: id.to_string(),
        }
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connecting
            .remove(&self.id);
    }
}

fn jid_key(session: &AccountSession) -> String {
    session.jid().to_string().to_lowercase()
}

/// The set of live account sessions, keyed by account id and by bare JID.
///
/// Readers get `Arc` snapshots; a session whose connection drops is removed
/// automatically.
pub struct AccountManager {
    registry: Arc<RwLock<Registry>>,
    options: ChatOptions,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl AccountManager {
    pub fn new(options: ChatOptions) -> Self {
        Self {
            registry: Arc::default(),
            options,
            event_bus: None,
        }
    }

    pub fn with_event_bus(options: ChatOptions, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus: Some(event_bus),
            ..Self::new(options)
        }
    }

    pub fn from_config(config: &Config, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        Self {
            event_bus,
            ..Self::new(ChatOptions::from(&config.discovery))
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect `account` over a transport of type `T` and register the session.
    pub async fn connect<T: XmppTransport>(
        &self,
        account: &AccountConfig,
    ) -> Result<Arc<AccountSession>, AccountError> {
        bare_key(&account.jid)?;
        let _connecting = ConnectingGuard::new(&self.registry, &account.id);

        let config = ConnectionConfig::from(account);
        let connection = Connection::connect::<T>(&config, self.event_bus.clone())
            .await
            .inspect_err(|error| {
                warn!(account = %account.id, %error, "account failed to connect");
            })?;
        Ok(self.register_connection(account, connection))
    }

    /// Register `account` on a transport the caller has already negotiated.
    pub fn attach<T: XmppTransport>(
        &self,
        account: &AccountConfig,
        transport: T,
    ) -> Result<Arc<AccountSession>, AccountError> {
        let jid = BareJid::new(&account.jid)
            .map_err(|error| AccountError::InvalidJid(format!("{}: {error}", account.jid)))?;
        let connection = Connection::start(transport, jid, self.event_bus.clone());
        Ok(self.register_connection(account, connection))
    }

    fn register_connection(
        &self,
        account: &AccountConfig,
        connection: Connection,
    ) -> Arc<AccountSession> {
        let session =
            AccountSession::new(account.id.clone(), account.label(), connection, self.options);
        self.register(session)
    }

    /// Make `session` the live session for its account id, replacing and
    /// closing any previous one. Must be called within a tokio runtime.
    pub fn register(&self, session: AccountSession) -> Arc<AccountSession> {
        let session = Arc::new(session);
        let id = session.id().to_string();

        let previous = {
            let mut registry = self.write();
            let previous = registry.remove(&id, None);
            registry.insert(Arc::clone(&session));
            previous
        };

        if let Some(previous) = previous {
            info!(account = %id, "replacing existing session");
            previous.connection().close();
        }

        self.watch(&session);
        info!(account = %id, jid = %session.jid(), "account connected");
        self.emit(
            "system.account.connected",
            EventPayload::AccountConnected {
                account_id: id,
                jid: session.jid().to_string(),
            },
        );
        session
    }

    /// Close and forget the session for `id`. Returns whether one existed.
    pub fn disconnect(&self, id: &str) -> bool {
        let Some(session) = self.write().remove(id, None) else {
            return false;
        };
        session.connection().close();
        info!(account = %id, "account disconnected");
        self.emit(
            "system.account.disconnected",
            EventPayload::AccountDisconnected {
                account_id: id.to_string(),
                reason: "disconnected by user".to_string(),
            },
        );
        true
    }

    /// Snapshot of every session whose connection is up, ordered by id.
    pub fn get_all_connected_accounts(&self) -> Vec<Arc<AccountSession>> {
        let mut sessions: Vec<_> = self
            .read()
            .by_id
            .values()
            .filter(|session| session.is_connected())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    pub fn get_account_by_id(&self, id: &str) -> Option<Arc<AccountSession>> {
        self.read()
            .by_id
            .get(id)
            .filter(|session| session.is_connected())
            .cloned()
    }

    /// Look up by address; the resource part and letter case are ignored.
    /// When several accounts share the address, the most recently registered
    /// connected one wins.
    pub fn get_account_by_jid(
        &self,
        jid: &str,
    ) -> Result<Option<Arc<AccountSession>>, AccountError> {
        let key = bare_key(jid)?;
        let registry = self.read();
        let Some(ids) = registry.by_jid.get(&key) else {
            return Ok(None);
        };
        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| registry.by_id.get(id))
            .find(|session| session.is_connected())
            .cloned())
    }

    pub fn account_state(&self, id: &str) -> ConnectionState {
        let registry = self.read();
        if let Some(session) = registry.by_id.get(id) {
            return session.state();
        }
        if registry.connecting.contains(id) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Drop the session from the registry once its connection goes down.
    fn watch(&self, session: &Arc<AccountSession>) {
        let mut state = session.connection().subscribe_state();
        let registry = Arc::downgrade(&self.registry);
        let watched = Arc::downgrade(session);
        let id = session.id().to_string();
        let event_bus = self.event_bus.clone();

        tokio::spawn(async move {
            let _ = state
                .wait_for(|state| *state == ConnectionState::Disconnected)
                .await;
            forget_session(&registry, &watched, &id, event_bus.as_deref());
        });
    }

    fn emit(&self, channel_name: &str, payload: EventPayload) {
        if let Some(event_bus) = &self.event_bus {
            publish_best_effort(
                event_bus.as_ref(),
                channel_name,
                EventSource::System("accounts".to_string()),
                payload,
            );
        }
    }
}

fn forget_session(
    registry: &Weak<RwLock<Registry>>,
    watched: &Weak<AccountSession>,
    id: &str,
    event_bus: Option<&dyn EventBus>,
) {
    let (Some(registry), Some(session)) = (registry.upgrade(), watched.upgrade()) else {
        return;
    };
    let removed = registry
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id, Some(&session));
    if removed.is_none() {
        debug!(account = %id, "closed session was already replaced or removed");
        return;
    }

    info!(account = %id, "account connection dropped");
    if let Some(event_bus) = event_bus {
        publish_best_effort(
            event_bus,
            "system.account.disconnected",
            EventSource::System("accounts".to_string()),
            EventPayload::AccountDisconnected {
                account_id: id.to_string(),
                reason: "connection lost".to_string(),
            },
        );
    }
}
