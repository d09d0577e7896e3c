pub mod chat;
pub mod connection;
pub mod disco;
pub mod error;
pub mod muc;
pub mod pending;
pub mod room_info;
pub mod stanza;
pub mod transport;

pub use chat::{ChatContext, ChatOptions};
pub use connection::{Connection, ConnectionState};
pub use disco::{DiscoInfo, RoomItem};
pub use error::{ChatError, ConnectionError, PipelineError};
pub use muc::Occupant;
pub use pending::DispatchOutcome;
pub use room_info::{Anonymity, Membership, RoomInfo};
pub use stanza::Stanza;
pub use transport::{ChannelTransport, ConnectionConfig, TransportPeer, XmppTransport};

pub use xmpp_parsers::jid::{BareJid, Jid};
