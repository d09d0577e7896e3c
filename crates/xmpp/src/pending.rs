//! Correlation of outbound requests with their replies.
//!
//! Every request registers a slot before its stanza is written. The inbound
//! path completes a slot at most once; a waiter that gives up (timeout,
//! cancellation) evicts its own slot when its [`PendingReply`] is dropped, so a
//! late reply finds nothing and is discarded.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use xmpp_parsers::jid::Jid;

use crate::{error::ChatError, muc::has_self_status, stanza::Stanza};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PendingKey {
    /// An iq request, by stanza id.
    Iq(String),
    /// A room join, by the room's bare address.
    Join(String),
}

/// Which inbound stanza is allowed to complete a slot.
#[derive(Debug, Clone)]
pub(crate) enum ReplyMatcher {
    /// iq replies must come from the address the request went to. Servers
    /// answer queries to the account's own domain without a `from`.
    From { jid: Jid, allow_missing: bool },
    /// Join outcomes: our own occupant presence, a self-presence status, or an
    /// error from the room.
    Occupant { occupant_jid: Jid },
}

impl ReplyMatcher {
    fn accepts(&self, stanza: &Stanza) -> bool {
        match self {
            Self::From { jid, allow_missing } => match stanza.from() {
                Some(from) => from == jid,
                None => *allow_missing,
            },
            Self::Occupant { occupant_jid } => match stanza {
                Stanza::Presence(presence) => {
                    stanza.is_error()
                        || has_self_status(presence)
                        || presence.from.as_ref() == Some(occupant_jid)
                }
                _ => false,
            },
        }
    }
}

/// Result of handing an inbound stanza to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Nobody is waiting for this stanza.
    Unmatched,
    /// A slot exists but the stanza did not come from where the reply was
    /// expected.
    Rejected,
}

struct Slot {
    token: u64,
    matcher: ReplyMatcher,
    sender: oneshot::Sender<Result<Stanza, ChatError>>,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    slots: HashMap<PendingKey, Slot>,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
    next_token: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests still waiting for a reply.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        key: PendingKey,
        matcher: ReplyMatcher,
    ) -> Result<PendingReply, ChatError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        let mut inner = self.lock();
        if inner.closed {
            return Err(ChatError::NotConnected);
        }
        let previous = inner.slots.insert(
            key.clone(),
            Slot {
                token,
                matcher,
                sender,
            },
        );
        drop(inner);

        if let Some(previous) = previous {
            debug!(?key, "superseding in-flight request with the same key");
            let _ = previous.sender.send(Err(ChatError::Canceled));
        }

        Ok(PendingReply {
            key,
            token,
            registry: Arc::clone(self),
            receiver,
        })
    }

    /// Route an inbound stanza to the request waiting for it, if any.
    pub fn dispatch(&self, stanza: Stanza) -> DispatchOutcome {
        let Some(key) = reply_key(&stanza) else {
            return DispatchOutcome::Unmatched;
        };

        let mut inner = self.lock();
        let Some(slot) = inner.slots.get(&key) else {
            drop(inner);
            debug!(?key, "dropping reply with no pending request");
            return DispatchOutcome::Unmatched;
        };

        if !slot.matcher.accepts(&stanza) {
            let wanted_iq = matches!(key, PendingKey::Iq(_));
            drop(inner);
            if wanted_iq {
                warn!(
                    ?key,
                    from = stanza.from().map(Jid::as_str).unwrap_or_default(),
                    "ignoring reply from unexpected sender"
                );
                return DispatchOutcome::Rejected;
            }
            // Another occupant's presence while our join is in flight.
            return DispatchOutcome::Unmatched;
        }

        let Some(slot) = inner.slots.remove(&key) else {
            return DispatchOutcome::Unmatched;
        };
        drop(inner);

        if slot.sender.send(Ok(stanza)).is_err() {
            debug!(?key, "reply arrived after its waiter went away");
        }
        DispatchOutcome::Delivered
    }

    /// Fail every outstanding request and refuse new ones. Returns how many
    /// requests were failed.
    pub fn fail_all(&self, error: ChatError) -> usize {
        let drained: Vec<Slot> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.slots.drain().map(|(_, slot)| slot).collect()
        };

        let count = drained.len();
        for slot in drained {
            let _ = slot.sender.send(Err(error.clone()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn evict(&self, key: &PendingKey, token: u64) {
        let mut inner = self.lock();
        if inner.slots.get(key).is_some_and(|slot| slot.token == token) {
            inner.slots.remove(key);
        }
    }
}

/// Handle to one outstanding request. Dropping it before a reply arrives
/// withdraws the request.
pub(crate) struct PendingReply {
    key: PendingKey,
    token: u64,
    registry: Arc<PendingRequests>,
    receiver: oneshot::Receiver<Result<Stanza, ChatError>>,
}

impl PendingReply {
    pub(crate) async fn wait(mut self, bound: Duration) -> Result<Stanza, ChatError> {
        match tokio::time::timeout(bound, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChatError::NotConnected),
            Err(_) => Err(ChatError::Timeout),
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.evict(&self.key, self.token);
    }
}

fn reply_key(stanza: &Stanza) -> Option<PendingKey> {
    match stanza {
        Stanza::Iq(iq) if stanza.is_iq_response() => Some(PendingKey::Iq(iq.id.clone())),
        Stanza::Presence(presence) => presence
            .from
            .as_ref()
            .map(|from| PendingKey::Join(room_key(from))),
        _ => None,
    }
}

/// Normalized bare address of a room or occupant JID.
pub(crate) fn room_key(jid: &Jid) -> String {
    jid.to_bare().as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn iq_result(id: &str, from: &str) -> Stanza {
        Stanza::parse(
            format!("<iq xmlns='jabber:client' type='result' id='{id}' from='{from}'/>").as_bytes(),
        )
        .unwrap()
    }

    fn jid(address: &str) -> Jid {
        Jid::new(address).unwrap()
    }

    fn from_service() -> ReplyMatcher {
        ReplyMatcher::From {
            jid: jid("conference.example.org"),
            allow_missing: false,
        }
    }

    #[tokio::test]
    async fn reply_completes_matching_request() {
        let registry = Arc::new(PendingRequests::new());
        let reply = registry
            .register(PendingKey::Iq("q1".into()), from_service())
            .unwrap();

        assert_eq!(
            registry.dispatch(iq_result("q1", "conference.example.org")),
            DispatchOutcome::Delivered
        );
        let stanza = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stanza.id(), Some("q1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reply_from_other_sender_is_rejected() {
        let registry = Arc::new(PendingRequests::new());
        let _reply = registry
            .register(PendingKey::Iq("q1".into()), from_service())
            .unwrap();

        assert_eq!(
            registry.dispatch(iq_result("q1", "evil.example.org")),
            DispatchOutcome::Rejected
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_unmatched() {
        let registry = Arc::new(PendingRequests::new());
        assert_eq!(
            registry.dispatch(iq_result("nobody", "conference.example.org")),
            DispatchOutcome::Unmatched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_evicts_slot_and_late_reply_is_dropped() {
        let registry = Arc::new(PendingRequests::new());
        let reply = registry
            .register(PendingKey::Iq("q1".into()), from_service())
            .unwrap();

        assert_matches!(
            reply.wait(Duration::from_millis(500)).await,
            Err(ChatError::Timeout)
        );
        assert!(registry.is_empty());
        assert_eq!(
            registry.dispatch(iq_result("q1", "conference.example.org")),
            DispatchOutcome::Unmatched
        );
    }

    #[tokio::test]
    async fn fail_all_completes_waiters_and_closes_registry() {
        let registry = Arc::new(PendingRequests::new());
        let first = registry
            .register(PendingKey::Iq("a".into()), from_service())
            .unwrap();
        let second = registry
            .register(PendingKey::Join("lobby@conference.example.org".into()), from_service())
            .unwrap();

        assert_eq!(registry.fail_all(ChatError::NotConnected), 2);
        assert_matches!(first.wait(Duration::from_secs(1)).await, Err(ChatError::NotConnected));
        assert_matches!(second.wait(Duration::from_secs(1)).await, Err(ChatError::NotConnected));

        assert!(registry.is_closed());
        assert_matches!(
            registry.register(PendingKey::Iq("b".into()), from_service()),
            Err(ChatError::NotConnected)
        );
    }

    #[tokio::test]
    async fn second_join_to_same_room_cancels_first() {
        let registry = Arc::new(PendingRequests::new());
        let key = PendingKey::Join("lobby@conference.example.org".into());
        let matcher = ReplyMatcher::Occupant {
            occupant_jid: jid("lobby@conference.example.org/alice"),
        };
        let first = registry.register(key.clone(), matcher.clone()).unwrap();
        let second = registry.register(key, matcher).unwrap();

        assert_matches!(first.wait(Duration::from_secs(1)).await, Err(ChatError::Canceled));
        // The superseded waiter must not evict the newer slot.
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn occupant_matcher_ignores_other_occupants() {
        let registry = Arc::new(PendingRequests::new());
        let _reply = registry
            .register(
                PendingKey::Join("lobby@conference.example.org".into()),
                ReplyMatcher::Occupant {
                    occupant_jid: jid("lobby@conference.example.org/alice"),
                },
            )
            .unwrap();

        let other = Stanza::parse(
            b"<presence xmlns='jabber:client' from='lobby@conference.example.org/bob'/>",
        )
        .unwrap();
        assert_eq!(registry.dispatch(other), DispatchOutcome::Unmatched);

        let own = Stanza::parse(
            b"<presence xmlns='jabber:client' from='lobby@conference.example.org/alice'/>",
        )
        .unwrap();
        assert_eq!(registry.dispatch(own), DispatchOutcome::Delivered);
    }

    #[test]
    fn room_key_strips_resource_and_normalizes_case() {
        assert_eq!(
            room_key(&jid("Lobby@Conference.Example.org/alice")),
            "lobby@conference.example.org"
        );
    }
}
