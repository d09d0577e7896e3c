use chrono::{DateTime, Utc};
#[cfg(feature = "native")]
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
#[cfg(feature = "native")]
use tokio::sync::broadcast;
use uuid::Uuid;

#[cfg(feature = "native")]
use crate::{config::EventBusConfig, error::EventBusError};

/// Top-level segment of a channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    System,
    Xmpp,
    Ui,
}

impl Domain {
    #[cfg(feature = "native")]
    const ALL: [Domain; 3] = [Domain::System, Domain::Xmpp, Domain::Ui];

    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "system" => Some(Self::System),
            "xmpp" => Some(Self::Xmpp),
            "ui" => Some(Self::Ui),
            _ => None,
        }
    }
}

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase a-z, 0-9 and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        Domain::parse(name.split('.').next().unwrap_or_default()).is_some()
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "xmpp.muc.rooms.listed")
    pub channel: Channel,

    pub timestamp: DateTime<Utc>,

    pub id: Uuid,

    /// Links a result event to the request that caused it
    pub correlation_id: Option<Uuid>,

    pub source: EventSource,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    System(String),
    Xmpp,
    Ui,
}

/// A room as presented to UI consumers of discovery results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub jid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    ConnectionEstablished {
        jid: String,
    },
    ConnectionLost {
        jid: String,
        reason: String,
    },
    AccountConnected {
        account_id: String,
        jid: String,
    },
    AccountDisconnected {
        account_id: String,
        reason: String,
    },

    // ── XMPP MUC discovery events ─────────────────────────────────
    RoomsListed {
        account_id: String,
        service: String,
        rooms: Vec<RoomSummary>,
    },
    RoomQueryFailed {
        account_id: String,
        target: String,
        reason: String,
    },
    RoomInfoReceived {
        account_id: String,
        room: String,
        name: Option<String>,
        occupants: Option<u32>,
        members_only: bool,
    },
    MucJoined {
        account: String,
        room: String,
        nick: String,
    },
    MucJoinFailed {
        account: String,
        room: String,
        nick: String,
        reason: String,
    },

    // ── UI requests ───────────────────────────────────────────────
    RoomListRequested {
        account_id: String,
        service: String,
    },
    RoomInfoRequested {
        account_id: String,
        room: String,
    },
    RoomBrowserClosed,
}

#[cfg(feature = "native")]
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

#[cfg(feature = "native")]
/// Publish on `channel_name`, ignoring invalid channels and absent subscribers.
pub fn publish_best_effort(
    event_bus: &dyn EventBus,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
) {
    let Ok(channel) = Channel::new(channel_name) else {
        tracing::warn!(channel = channel_name, "refusing to publish on invalid channel");
        return;
    };
    let _ = event_bus.publish(Event::new(channel, source, payload));
}

/// In-process bus with one broadcast queue per domain, so a burst on one
/// domain cannot make subscribers of another lag.
#[cfg(feature = "native")]
#[derive(Clone)]
pub struct BroadcastEventBus {
    queues: [broadcast::Sender<Event>; 3],
}

#[cfg(feature = "native")]
impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        Self {
            queues: Domain::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    pub fn from_config(config: &EventBusConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    fn queue(&self, domain: Domain) -> &broadcast::Sender<Event> {
        &self.queues[domain as usize]
    }
}

#[cfg(feature = "native")]
impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(feature = "native")]
impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        let domain = Domain::parse(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;
        // No subscribers is not an error.
        let _ = self.queue(domain).send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let invalid = || EventBusError::InvalidPattern(pattern.to_string());
        let matcher = Glob::new(pattern).map_err(|_| invalid())?.compile_matcher();

        let first = pattern.split('.').next().unwrap_or_default();
        let scope = if first.is_empty() {
            return Err(invalid());
        } else if first.contains(['*', '?', '[', ']', '{', '}', '!']) {
            None
        } else {
            Some(Domain::parse(first).ok_or_else(invalid)?)
        };

        let receivers = Domain::ALL.map(|domain| {
            scope
                .is_none_or(|wanted| wanted == domain)
                .then(|| self.queue(domain).subscribe())
        });
        Ok(EventSubscription { matcher, receivers })
    }
}

/// Events whose channel matches a glob pattern. Only the domains the pattern
/// can match are listened to.
#[cfg(feature = "native")]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: [Option<broadcast::Receiver<Event>>; 3],
}

#[cfg(feature = "native")]
impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            let [system, xmpp, ui] = &mut self.receivers;
            let received = tokio::select! {
                result = next_event(system) => result,
                result = next_event(xmpp) => result,
                result = next_event(ui) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(EventBusError::Lagged(missed));
                }
            }
        }
    }
}

#[cfg(feature = "native")]
async fn next_event(
    receiver: &mut Option<broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("xmpp.muc.rooms.listed"));
        assert!(Channel::is_valid("ui.muc.rooms.request"));

        assert!(!Channel::is_valid("plugin.test.event"));
        assert!(!Channel::is_valid("xmpp..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("xmpp.ends.with.dot."));
        assert!(!Channel::is_valid("xmpp.UpperCase"));
        assert!(!Channel::is_valid("xmpp.with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain_and_display() {
        let c = Channel::new("xmpp.muc.joined").unwrap();
        assert_eq!(c.domain(), "xmpp");
        assert_eq!(c.to_string(), "xmpp.muc.joined");
        let s: String = c.into();
        assert_eq!(s, "xmpp.muc.joined");
    }

    #[test]
    fn event_with_correlation_keeps_fresh_id() {
        let corr_id = Uuid::new_v4();
        let event = Event::with_correlation(
            Channel::new("xmpp.muc.rooms.failed").unwrap(),
            EventSource::Xmpp,
            EventPayload::RoomQueryFailed {
                account_id: "work".into(),
                target: "conference.example.org".into(),
                reason: "request timed out".into(),
            },
            corr_id,
        );

        assert_eq!(event.correlation_id, Some(corr_id));
        assert_ne!(event.id, corr_id);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::RoomsListed {
            account_id: "work".into(),
            service: "conference.example.org".into(),
            rooms: vec![RoomSummary {
                jid: "lobby@conference.example.org".into(),
                name: "Lobby".into(),
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "roomsListed");
        assert_eq!(json["data"]["rooms"][0]["name"], "Lobby");
    }
}
