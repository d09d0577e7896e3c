use tokio::sync::mpsc;

use crate::error::ConnectionError;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub timeout_seconds: u32,
}

impl ConnectionConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            server: None,
            port: None,
            timeout_seconds: 30,
        }
    }
}

impl From<&waddle_core::config::AccountConfig> for ConnectionConfig {
    fn from(account: &waddle_core::config::AccountConfig) -> Self {
        Self {
            server: account.server.clone(),
            port: account.port,
            ..Self::new(account.jid.clone(), account.password.clone())
        }
    }
}

/// A negotiated XMPP stream that carries whole top-level stanzas.
///
/// Stream setup (TLS, SASL, resource binding) is the transport's business;
/// by the time `connect` returns the stream is ready for stanzas.
/// `recv` must be cancel-safe: the connection task polls it inside `select!`.
pub trait XmppTransport: Send + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport backed by a pair of channels.
///
/// Lets an application that already owns a negotiated stream hand stanzas
/// across: the application keeps the [`TransportPeer`] and pumps bytes
/// between it and its socket.
pub struct ChannelTransport {
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

/// The far end of a [`ChannelTransport`].
pub struct TransportPeer {
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, TransportPeer) {
        let (to_client, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        (
            ChannelTransport {
                outbound: Some(outbound),
                inbound,
            },
            TransportPeer {
                inbound: to_client,
                outbound: from_client,
            },
        )
    }
}

impl XmppTransport for ChannelTransport {
    /// Channel transports have no server to dial; build them with
    /// [`ChannelTransport::pair`] and hand them to [`Connection::start`].
    ///
    /// [`Connection::start`]: crate::Connection::start
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        Err(ConnectionError::TransportError(format!(
            "cannot dial {}: channel transports are created with ChannelTransport::pair",
            config.jid
        )))
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let Some(outbound) = &self.outbound else {
            return Err(ConnectionError::Closed);
        };
        outbound
            .send(data.to_vec())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.inbound.recv().await.ok_or(ConnectionError::Closed)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }
}

impl TransportPeer {
    /// Deliver a stanza to the client side.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), ConnectionError> {
        self.inbound
            .send(data.into())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Next stanza written by the client, or `None` once it closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Whether the client side has hung up.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_bytes_both_ways() {
        let (mut transport, mut peer) = ChannelTransport::pair();

        transport.send(b"<presence/>").await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some(&b"<presence/>"[..]));

        peer.send("<iq/>").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), b"<iq/>".to_vec());
    }

    #[tokio::test]
    async fn dropping_peer_ends_recv() {
        let (mut transport, peer) = ChannelTransport::pair();
        drop(peer);
        assert!(matches!(transport.recv().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn close_is_visible_to_peer() {
        let (mut transport, mut peer) = ChannelTransport::pair();
        transport.close().await.unwrap();

        assert!(peer.recv().await.is_none());
        assert!(peer.is_closed());
        assert!(matches!(
            transport.send(b"<presence/>").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn channel_transport_cannot_dial() {
        let config = ConnectionConfig::new("alice@example.org", "secret");
        assert!(matches!(
            ChannelTransport::connect(&config).await,
            Err(ConnectionError::TransportError(message)) if message.contains("alice@example.org")
        ));
    }
}
