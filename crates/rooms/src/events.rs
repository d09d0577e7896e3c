use waddle_core::event::{EventPayload, RoomSummary};
use waddle_xmpp::{ChatError, RoomInfo, RoomItem};

pub(crate) type Announcement = (&'static str, EventPayload);

pub(crate) fn rooms_listed(
    account_id: &str,
    service: &str,
    outcome: &Result<Vec<RoomItem>, ChatError>,
) -> Option<Announcement> {
    match outcome {
        Ok(rooms) => Some((
            "xmpp.muc.rooms.listed",
            EventPayload::RoomsListed {
                account_id: account_id.to_string(),
                service: service.to_string(),
                rooms: rooms
                    .iter()
                    .map(|room| RoomSummary {
                        jid: room.jid.clone(),
                        name: room.name.clone(),
                    })
                    .collect(),
            },
        )),
        Err(error) => failed(account_id, service, error),
    }
}

pub(crate) fn room_info_received(
    account_id: &str,
    room: &str,
    outcome: &Result<RoomInfo, ChatError>,
) -> Option<Announcement> {
    match outcome {
        Ok(info) => Some((
            "xmpp.muc.info.received",
            EventPayload::RoomInfoReceived {
                account_id: account_id.to_string(),
                room: info.address.clone(),
                name: info.name.clone(),
                occupants: info.occupants,
                members_only: info.members_only(),
            },
        )),
        Err(error) => failed(account_id, room, error),
    }
}

// Superseded and canceled queries stay quiet.
fn failed(account_id: &str, target: &str, error: &ChatError) -> Option<Announcement> {
    if *error == ChatError::Canceled {
        return None;
    }
    Some((
        "xmpp.muc.rooms.failed",
        EventPayload::RoomQueryFailed {
            account_id: account_id.to_string(),
            target: target.to_string(),
            reason: error.to_string(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_outcomes_are_not_announced() {
        assert!(rooms_listed("work", "conference.example.org", &Err(ChatError::Canceled)).is_none());
    }

    #[test]
    fn empty_listing_is_announced_as_listed() {
        let (channel, payload) =
            rooms_listed("work", "conference.example.org", &Ok(Vec::new())).unwrap();
        assert_eq!(channel, "xmpp.muc.rooms.listed");
        assert!(matches!(payload, EventPayload::RoomsListed { rooms, .. } if rooms.is_empty()));
    }

    #[test]
    fn failures_carry_reason() {
        let (channel, payload) =
            room_info_received("work", "ghost@conference.example.org", &Err(ChatError::Timeout))
                .unwrap();
        assert_eq!(channel, "xmpp.muc.rooms.failed");
        assert!(matches!(
            payload,
            EventPayload::RoomQueryFailed { reason, .. } if reason == "request timed out"
        ));
    }
}
