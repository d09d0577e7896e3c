use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use waddle_core::event::{EventBus, EventPayload, EventSource, publish_best_effort};
use xmpp_parsers::jid::{BareJid, Jid};

pub use crate::transport::ConnectionConfig;
use crate::{
    error::{ChatError, ConnectionError},
    pending::{DispatchOutcome, PendingKey, PendingReply, PendingRequests, ReplyMatcher},
    stanza::Stanza,
    transport::XmppTransport,
};

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A live XMPP stream for one account.
///
/// Cheap to clone; all clones share one I/O task. The task ends when the
/// transport fails, [`Connection::close`] is called, or the last clone is
/// dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    jid: BareJid,
    outbound: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

/// State shared between the handles and the I/O task.
struct Shared {
    jid: String,
    state: watch::Sender<ConnectionState>,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl Connection {
    /// Open a transport of type `T` and start the connection on it.
    pub async fn connect<T: XmppTransport>(
        config: &ConnectionConfig,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Result<Self, ConnectionError> {
        let jid = parse_account_jid(&config.jid)?;
        info!(jid = %jid, "connecting");

        let bound = Duration::from_secs(u64::from(config.timeout_seconds.max(1)));
        let transport = tokio::time::timeout(bound, T::connect(config))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        Ok(Self::start(transport, jid, event_bus))
    }

    /// Run an already negotiated transport. Must be called within a tokio
    /// runtime.
    pub fn start<T: XmppTransport>(
        transport: T,
        jid: BareJid,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared {
            jid: jid.to_string(),
            state,
            pending: Arc::new(PendingRequests::new()),
            shutdown: CancellationToken::new(),
            event_bus,
        });

        let span = info_span!("connection", jid = %shared.jid);
        tokio::spawn(run_io(transport, outbound_rx, Arc::clone(&shared)).instrument(span));
        shared.emit(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                jid: shared.jid.clone(),
            },
        );
        info!(jid = %shared.jid, "connection established");

        Self {
            inner: Arc::new(ConnectionInner {
                jid,
                outbound,
                shared,
            }),
        }
    }

    pub fn jid(&self) -> &BareJid {
        &self.inner.jid
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Resolves once the connection has reached `Disconnected`.
    pub async fn closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Close the stream. In-flight requests fail with `NotConnected` before
    /// this returns; the transport is shut down by the I/O task.
    pub fn close(&self) {
        self.inner.shared.shutdown.cancel();
        self.inner.shared.mark_disconnected("closed locally");
    }

    /// Write a stanza. Fails without touching the wire unless connected.
    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), ChatError> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let stanza = stanza.into();
        let bytes = stanza
            .to_bytes()
            .map_err(|error| ChatError::Encoding(error.to_string()))?;

        debug!(
            jid = %self.inner.jid,
            stanza = stanza.name(),
            id = stanza.id().unwrap_or_default(),
            to = stanza.to().map(Jid::as_str).unwrap_or_default(),
            "sending stanza"
        );
        self.inner
            .outbound
            .send(bytes)
            .await
            .map_err(|_| ChatError::NotConnected)
    }

    pub(crate) fn register(
        &self,
        key: PendingKey,
        matcher: ReplyMatcher,
    ) -> Result<PendingReply, ChatError> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.inner.shared.pending.register(key, matcher)
    }

    pub(crate) fn emit(&self, channel_name: &str, payload: EventPayload) {
        self.inner.shared.emit(channel_name, payload);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("jid", &self.inner.jid)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    /// Idempotent: only the first caller fails the pending requests and emits.
    fn mark_disconnected(&self, reason: &str) {
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }

        let failed = self.pending.fail_all(ChatError::NotConnected);
        info!(jid = %self.jid, reason, failed, "connection closed");
        self.emit(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                jid: self.jid.clone(),
                reason: reason.to_string(),
            },
        );
    }

    fn emit(&self, channel_name: &str, payload: EventPayload) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };
        publish_best_effort(event_bus.as_ref(), channel_name, EventSource::Xmpp, payload);
    }
}

async fn run_io<T: XmppTransport>(
    mut transport: T,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break "closed locally".to_string(),
            frame = outbound_rx.recv() => match frame {
                Some(bytes) => {
                    if let Err(error) = transport.send(&bytes).await {
                        warn!(jid = %shared.jid, %error, "transport send failed");
                        break error.to_string();
                    }
                }
                None => break "connection dropped".to_string(),
            },
            inbound = transport.recv() => match inbound {
                Ok(bytes) => dispatch_inbound(&shared, &bytes),
                Err(error) => break error.to_string(),
            },
        }
    };

    if let Err(error) = transport.close().await {
        debug!(jid = %shared.jid, %error, "transport close failed");
    }
    shared.mark_disconnected(&reason);
}

fn dispatch_inbound(shared: &Shared, bytes: &[u8]) {
    let stanza = match Stanza::parse(bytes) {
        Ok(stanza) => stanza,
        Err(error) => {
            warn!(jid = %shared.jid, %error, "dropping unparsable inbound frame");
            return;
        }
    };

    let name = stanza.name();
    let id = stanza.id().unwrap_or_default().to_string();
    if shared.pending.dispatch(stanza) == DispatchOutcome::Delivered {
        debug!(jid = %shared.jid, stanza = name, %id, "reply delivered");
    }
}

fn parse_account_jid(jid: &str) -> Result<BareJid, ConnectionError> {
    BareJid::new(jid).map_err(|error| {
        ConnectionError::AuthenticationFailed(format!("invalid JID {jid}: {error}"))
    })
}
