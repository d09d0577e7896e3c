pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// A stanza fixture with its `{id}` placeholder bound to `id`.
    pub fn reply(name: &str, id: &str) -> String {
        stanza(name).replace("{id}", id)
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod xmpp {
    use std::sync::Arc;
    use std::time::Duration;

    use waddle_core::event::EventBus;
    use waddle_xmpp::{BareJid, ChannelTransport, Connection, Stanza, TransportPeer};

    use crate::fixtures;

    const REQUEST_WAIT: Duration = Duration::from_secs(5);

    /// Server side of an in-process connection, driven step by step by a test.
    pub struct ScriptedPeer {
        peer: TransportPeer,
    }

    impl ScriptedPeer {
        pub fn new(peer: TransportPeer) -> Self {
            Self { peer }
        }

        /// Next stanza the client wrote. Panics if the client hung up or
        /// stayed silent.
        pub async fn next_request(&mut self) -> Stanza {
            self.try_next_request()
                .await
                .expect("client closed the stream before sending a request")
        }

        /// Next stanza the client wrote, or `None` once it closed the stream.
        pub async fn try_next_request(&mut self) -> Option<Stanza> {
            let frame = tokio::time::timeout(REQUEST_WAIT, self.peer.recv())
                .await
                .expect("timed out waiting for the client")?;
            Some(Stanza::parse(&frame).expect("client wrote an unparsable stanza"))
        }

        pub async fn send(&self, xml: impl Into<String>) {
            self.peer
                .send(xml.into())
                .await
                .expect("client side of the stream is gone");
        }

        /// Answer `request` with a fixture, echoing its id.
        pub async fn answer(&self, request: &Stanza, fixture: &str) {
            let id = request.id().expect("request carries no id");
            self.send(fixtures::reply(fixture, id)).await;
        }

        /// Wait for the next request and answer it with a fixture.
        pub async fn reply_with(&mut self, fixture: &str) -> Stanza {
            let request = self.next_request().await;
            self.answer(&request, fixture).await;
            request
        }

        pub fn is_closed(&self) -> bool {
            self.peer.is_closed()
        }
    }

    /// A started connection for `jid` and the peer that plays its server.
    pub fn connection(
        jid: &str,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> (Connection, ScriptedPeer) {
        let (transport, peer) = ChannelTransport::pair();
        let jid = BareJid::new(jid).expect("test JID should be valid");
        (
            Connection::start(transport, jid, event_bus),
            ScriptedPeer::new(peer),
        )
    }
}
