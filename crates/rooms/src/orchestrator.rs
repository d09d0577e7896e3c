//! Per-account room discovery with last-query-wins semantics.
//!
//! At most one query is active per (account, kind, target). Starting another
//! supersedes it; the superseded query resolves to [`ChatError::Canceled`] or
//! not at all, never to a stale success.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use waddle_accounts::AccountManager;
use waddle_core::{
    error::EventBusError,
    event::{Channel, Event, EventBus, EventPayload, EventSource},
};
use waddle_xmpp::{ChatContext, ChatError, RoomInfo, RoomItem};

use crate::{
    error::RoomsError,
    events::{self, Announcement},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Rooms,
    RoomInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    account_id: String,
    kind: QueryKind,
    target: String,
}

struct ActiveQuery {
    generation: u64,
    token: CancellationToken,
}

/// Identifies one started query, for [`RoomQueryOrchestrator::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTicket {
    key: QueryKey,
    generation: u64,
}

impl QueryTicket {
    pub fn account_id(&self) -> &str {
        &self.key.account_id
    }

    pub fn kind(&self) -> QueryKind {
        self.key.kind
    }

    pub fn target(&self) -> &str {
        &self.key.target
    }
}

/// The pending outcome of a started query. Dropping the handle does not
/// cancel the query; its outcome is still published.
pub struct QueryHandle<T> {
    ticket: QueryTicket,
    outcome: oneshot::Receiver<Result<T, ChatError>>,
}

impl<T> QueryHandle<T> {
    pub fn ticket(&self) -> &QueryTicket {
        &self.ticket
    }

    /// Wait for the single outcome of this query.
    pub async fn outcome(self) -> Result<T, ChatError> {
        self.outcome.await.unwrap_or(Err(ChatError::Canceled))
    }
}

pub struct RoomQueryOrchestrator {
    accounts: Arc<AccountManager>,
    active: Arc<DashMap<QueryKey, ActiveQuery>>,
    next_generation: AtomicU64,
    event_bus: Option<Arc<dyn EventBus>>,
    default_service: Option<String>,
}

impl RoomQueryOrchestrator {
    pub fn new(accounts: Arc<AccountManager>) -> Self {
        Self {
            accounts,
            active: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            event_bus: None,
            default_service: None,
        }
    }

    pub fn with_event_bus(accounts: Arc<AccountManager>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus: Some(event_bus),
            ..Self::new(accounts)
        }
    }

    /// Service used by [`start_default`](Self::start_default) and by room list
    /// requests that name no service, normally `discovery.default_service`.
    pub fn with_default_service(mut self, service: Option<String>) -> Self {
        self.default_service = service.filter(|service| !service.trim().is_empty());
        self
    }

    pub fn default_service(&self) -> Option<&str> {
        self.default_service.as_deref()
    }

    /// List the rooms of `service` using `account_id`'s connection.
    pub fn start(&self, account_id: &str, service: &str) -> QueryHandle<Vec<RoomItem>> {
        let (sender, outcome) = oneshot::channel();
        let ticket = self.start_rooms(account_id, service, None, move |result| {
            let _ = sender.send(result);
        });
        QueryHandle { ticket, outcome }
    }

    /// Like [`start`](Self::start), handing the outcome to `callback` on the
    /// runtime instead of returning a handle.
    pub fn start_with_callback<F>(&self, account_id: &str, service: &str, callback: F) -> QueryTicket
    where
        F: FnOnce(Result<Vec<RoomItem>, ChatError>) + Send + 'static,
    {
        self.start_rooms(account_id, service, None, callback)
    }

    /// List the rooms of the configured default service. Without one the
    /// handle resolves to [`ChatError::InvalidJid`] and nothing is sent.
    pub fn start_default(&self, account_id: &str) -> QueryHandle<Vec<RoomItem>> {
        if let Some(service) = &self.default_service {
            return self.start(account_id, service);
        }

        let (sender, outcome) = oneshot::channel();
        let _ = sender.send(Err(no_default_service()));
        QueryHandle {
            ticket: QueryTicket {
                key: QueryKey {
                    account_id: account_id.to_string(),
                    kind: QueryKind::Rooms,
                    target: String::new(),
                },
                // Generations start at 1, so this ticket never cancels anything.
                generation: 0,
            },
            outcome,
        }
    }

    /// Fetch disco#info for `room`, superseding any earlier request for it.
    pub fn start_room_info(&self, account_id: &str, room: &str) -> QueryHandle<RoomInfo> {
        let (sender, outcome) = oneshot::channel();
        let ticket = self.start_info(account_id, room, None, move |result| {
            let _ = sender.send(result);
        });
        QueryHandle { ticket, outcome }
    }

    /// Best effort. `true` means the query was still active and its outcome
    /// will be [`ChatError::Canceled`]. `false` means it had already finished
    /// or been superseded, and its outcome is whatever was delivered then.
    pub fn cancel<T>(&self, handle: &QueryHandle<T>) -> bool {
        self.cancel_ticket(handle.ticket())
    }

    pub fn cancel_ticket(&self, ticket: &QueryTicket) -> bool {
        match self
            .active
            .remove_if(&ticket.key, |_, query| query.generation == ticket.generation)
        {
            Some((_, query)) => {
                debug!(
                    account = %ticket.key.account_id,
                    target = %ticket.key.target,
                    "query canceled"
                );
                query.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active query, e.g. when the room browser closes.
    pub fn cancel_all(&self) -> usize {
        let mut canceled = 0;
        self.active.retain(|_, query| {
            query.token.cancel();
            canceled += 1;
            false
        });
        canceled
    }

    pub fn pending_count(&self) -> usize {
        self.active.len()
    }

    /// Serve room browser requests published on `ui.**` until the bus closes.
    pub async fn run(self: Arc<Self>) -> Result<(), RoomsError> {
        let Some(event_bus) = self.event_bus.clone() else {
            return Err(RoomsError::SubscriptionFailed(
                "orchestrator has no event bus".to_string(),
            ));
        };
        let mut subscription = event_bus
            .subscribe("ui.**")
            .map_err(|e| RoomsError::SubscriptionFailed(e.to_string()))?;

        loop {
            match subscription.recv().await {
                Ok(event) => self.handle_event(&event),
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, room query orchestrator stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "room query orchestrator lagged, some requests dropped");
                }
                Err(e) => {
                    warn!(error = %e, "unexpected event bus error");
                }
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::RoomListRequested {
                account_id,
                service,
            } => {
                let service = if service.is_empty() {
                    self.default_service.as_deref()
                } else {
                    Some(service.as_str())
                };
                match service {
                    Some(service) => {
                        self.start_rooms(account_id, service, Some(event.id), |_| {});
                    }
                    None => {
                        warn!(account = %account_id, "room list requested without a service");
                        self.announce(
                            events::rooms_listed(account_id, "", &Err(no_default_service())),
                            Some(event.id),
                        );
                    }
                }
            }
            EventPayload::RoomInfoRequested { account_id, room } => {
                self.start_info(account_id, room, Some(event.id), |_| {});
            }
            EventPayload::RoomBrowserClosed => {
                let canceled = self.cancel_all();
                debug!(canceled, "room browser closed");
            }
            _ => {}
        }
    }

    fn announce(&self, announcement: Option<Announcement>, correlation: Option<Uuid>) {
        if let (Some(event_bus), Some((channel, payload))) = (&self.event_bus, announcement) {
            publish(event_bus.as_ref(), channel, payload, correlation);
        }
    }

    fn start_rooms<F>(
        &self,
        account_id: &str,
        service: &str,
        correlation: Option<Uuid>,
        deliver: F,
    ) -> QueryTicket
    where
        F: FnOnce(Result<Vec<RoomItem>, ChatError>) + Send + 'static,
    {
        self.launch(
            QueryKey {
                account_id: account_id.to_string(),
                kind: QueryKind::Rooms,
                target: service.to_string(),
            },
            |chat, service| async move { chat.query_rooms(&service).await },
            events::rooms_listed,
            correlation,
            deliver,
        )
    }

    fn start_info<F>(
        &self,
        account_id: &str,
        room: &str,
        correlation: Option<Uuid>,
        deliver: F,
    ) -> QueryTicket
    where
        F: FnOnce(Result<RoomInfo, ChatError>) + Send + 'static,
    {
        self.launch(
            QueryKey {
                account_id: account_id.to_string(),
                kind: QueryKind::RoomInfo,
                target: room.to_string(),
            },
            |chat, room| async move { chat.query_room_information(&room).await },
            events::room_info_received,
            correlation,
            deliver,
        )
    }

    fn launch<T, Q, Fut, F>(
        &self,
        key: QueryKey,
        query: Q,
        announce: fn(&str, &str, &Result<T, ChatError>) -> Option<Announcement>,
        correlation: Option<Uuid>,
        deliver: F,
    ) -> QueryTicket
    where
        T: Send + 'static,
        Q: FnOnce(ChatContext, String) -> Fut,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
        F: FnOnce(Result<T, ChatError>) + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.active.insert(
            key.clone(),
            ActiveQuery {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(account = %key.account_id, target = %key.target, "superseding active query");
            previous.token.cancel();
        }

        let ticket = QueryTicket { key, generation };
        let request = self
            .accounts
            .get_account_by_id(&ticket.key.account_id)
            .map(|session| query(session.chat().clone(), ticket.key.target.clone()));
        if request.is_none() {
            debug!(account = %ticket.key.account_id, "query for unknown or disconnected account");
        }

        let active = Arc::clone(&self.active);
        let event_bus = self.event_bus.clone();
        let task_ticket = ticket.clone();
        tokio::spawn(async move {
            let result = match request {
                None => Err(ChatError::NotConnected),
                Some(request) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ChatError::Canceled),
                    result = request => result,
                },
            };

            // Whoever removes the entry owns the outcome; losing means a newer
            // start or a cancel got there first.
            let current = active
                .remove_if(&task_ticket.key, |_, query| {
                    query.generation == task_ticket.generation
                })
                .is_some();
            let result = if current { result } else { Err(ChatError::Canceled) };

            if let (Some(event_bus), Some((channel, payload))) = (
                event_bus,
                announce(&task_ticket.key.account_id, &task_ticket.key.target, &result),
            ) {
                publish(event_bus.as_ref(), channel, payload, correlation);
            }
            deliver(result);
        });

        ticket
    }
}

fn no_default_service() -> ChatError {
    ChatError::InvalidJid("no default service configured".to_string())
}

fn publish(event_bus: &dyn EventBus, channel: &str, payload: EventPayload, correlation: Option<Uuid>) {
    let Ok(channel) = Channel::new(channel) else {
        warn!(channel, "refusing to publish on invalid channel");
        return;
    };
    let event = match correlation {
        Some(id) => Event::with_correlation(channel, EventSource::Xmpp, payload, id),
        None => Event::new(channel, EventSource::Xmpp, payload),
    };
    let _ = event_bus.publish(event);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use waddle_accounts::AccountSession;
    use waddle_test_support::xmpp::{ScriptedPeer, connection};
    use waddle_xmpp::ChatOptions;

    use super::*;

    const SERVICE: &str = "conference.example.org";

    fn orchestrator_with(id: &str, jid: &str) -> (RoomQueryOrchestrator, ScriptedPeer) {
        let accounts = Arc::new(AccountManager::new(ChatOptions::default()));
        let (conn, peer) = connection(jid, None);
        accounts.register(AccountSession::new(id, id, conn, ChatOptions::default()));
        (RoomQueryOrchestrator::new(accounts), peer)
    }

    #[tokio::test]
    async fn unknown_account_resolves_not_connected() {
        let orchestrator =
            RoomQueryOrchestrator::new(Arc::new(AccountManager::new(ChatOptions::default())));

        let handle = orchestrator.start("ghost", SERVICE);
        assert_matches!(handle.outcome().await, Err(ChatError::NotConnected));
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_yields_canceled_and_clears_entry() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");

        let handle = orchestrator.start("work", SERVICE);
        let _request = peer.next_request().await;
        assert_eq!(orchestrator.pending_count(), 1);

        assert!(orchestrator.cancel(&handle));
        assert!(!orchestrator.cancel(&handle));
        assert_matches!(handle.outcome().await, Err(ChatError::Canceled));
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_after_delivery_reports_false() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");

        let handle = orchestrator.start("work", SERVICE);
        let ticket = handle.ticket().clone();
        peer.reply_with("disco-items-empty.xml").await;
        assert_eq!(handle.outcome().await, Ok(Vec::new()));

        assert!(!orchestrator.cancel_ticket(&ticket));
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[tokio::test]
    async fn default_service_comes_from_config() {
        let config = waddle_core::config::load_config_from_str(
            &waddle_test_support::fixtures::config("two-accounts.toml"),
        )
        .unwrap();
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");
        let orchestrator = orchestrator.with_default_service(config.discovery.default_service);
        assert_eq!(orchestrator.default_service(), Some(SERVICE));

        let handle = orchestrator.start_default("work");
        assert_eq!(handle.ticket().target(), SERVICE);
        let request = peer.reply_with("disco-items-conference.xml").await;
        assert_eq!(request.to().map(waddle_xmpp::Jid::as_str), Some(SERVICE));
        assert_eq!(handle.outcome().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn start_default_without_service_sends_nothing() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");
        let orchestrator = orchestrator.with_default_service(Some("  ".to_string()));

        let handle = orchestrator.start_default("work");
        assert!(!orchestrator.cancel(&handle));
        assert_matches!(handle.outcome().await, Err(ChatError::InvalidJid(_)));
        assert_eq!(orchestrator.pending_count(), 0);
        let silence =
            tokio::time::timeout(Duration::from_millis(50), peer.try_next_request()).await;
        assert!(silence.is_err());
    }

    #[tokio::test]
    async fn late_reply_after_cancel_is_not_delivered() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");

        let handle = orchestrator.start("work", SERVICE);
        let request = peer.next_request().await;
        orchestrator.cancel(&handle);
        peer.answer(&request, "disco-items-conference.xml").await;

        assert_matches!(handle.outcome().await, Err(ChatError::Canceled));
    }

    #[tokio::test]
    async fn callback_receives_outcome_once() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");
        let (sender, receiver) = oneshot::channel();

        let ticket = orchestrator.start_with_callback("work", SERVICE, move |result| {
            let _ = sender.send(result);
        });
        assert_eq!(ticket.kind(), QueryKind::Rooms);
        peer.reply_with("disco-items-empty.xml").await;

        let rooms = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("callback should run")
            .unwrap()
            .unwrap();
        assert!(rooms.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_empties_the_table() {
        let (orchestrator, mut peer) = orchestrator_with("work", "alice@example.org");

        let rooms = orchestrator.start("work", SERVICE);
        let info = orchestrator.start_room_info("work", "lobby@conference.example.org");
        let _ = peer.next_request().await;
        let _ = peer.next_request().await;

        assert_eq!(orchestrator.cancel_all(), 2);
        assert_eq!(orchestrator.pending_count(), 0);
        assert_matches!(rooms.outcome().await, Err(ChatError::Canceled));
        assert_matches!(info.outcome().await, Err(ChatError::Canceled));
    }
}
