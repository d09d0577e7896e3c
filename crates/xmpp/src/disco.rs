//! Service discovery (XEP-0030) queries and reply parsing.

use tracing::debug;
use xmpp_parsers::{
    data_forms::{self, DataFormType},
    disco::{self as xep0030, DiscoInfoQuery, DiscoInfoResult, DiscoItemsQuery, DiscoItemsResult},
    iq::{Iq, IqType},
    jid::Jid,
    minidom::Element,
    ns,
};

use crate::{error::ChatError, stanza::Stanza};

/// One entry of a room listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomItem {
    /// Display name; the room's local part when the service sends none.
    pub name: String,
    pub jid: String,
    pub node: Option<String>,
    /// disco#items carries none; callers that also fetch room information
    /// fill it from [`RoomInfo::description`](crate::RoomInfo).
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub var: String,
    pub values: Vec<String>,
}

/// An extended-info data form (XEP-0128) attached to a disco#info reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataForm {
    pub form_type: Option<String>,
    pub fields: Vec<FormField>,
}

impl DataForm {
    pub fn value(&self, var: &str) -> Option<&str> {
        self.values(var).first().map(String::as_str)
    }

    pub fn values(&self, var: &str) -> &[String] {
        self.fields
            .iter()
            .find(|field| field.var == var)
            .map(|field| field.values.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    pub forms: Vec<DataForm>,
}

impl DiscoInfo {
    pub fn has_feature(&self, var: &str) -> bool {
        self.features.iter().any(|feature| feature == var)
    }

    pub fn form(&self, form_type: &str) -> Option<&DataForm> {
        self.forms
            .iter()
            .find(|form| form.form_type.as_deref() == Some(form_type))
    }

    pub fn has_identity(&self, category: &str, kind: &str) -> bool {
        self.identities
            .iter()
            .any(|identity| identity.category == category && identity.kind == kind)
    }
}

impl From<xep0030::Item> for RoomItem {
    fn from(item: xep0030::Item) -> Self {
        let name = item
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| fallback_name(&item.jid));
        Self {
            name,
            jid: item.jid.to_string(),
            node: item.node,
            description: None,
        }
    }
}

impl From<xep0030::Identity> for Identity {
    fn from(identity: xep0030::Identity) -> Self {
        Self {
            category: identity.category,
            kind: identity.type_,
            name: identity.name,
        }
    }
}

impl From<data_forms::DataForm> for DataForm {
    fn from(form: data_forms::DataForm) -> Self {
        let fields = form
            .fields
            .into_iter()
            .filter_map(|field| {
                field.var.map(|var| FormField {
                    var,
                    values: field.values,
                })
            })
            .collect();
        Self {
            form_type: form.form_type,
            fields,
        }
    }
}

impl From<DiscoInfoResult> for DiscoInfo {
    fn from(result: DiscoInfoResult) -> Self {
        Self {
            identities: result.identities.into_iter().map(Identity::from).collect(),
            features: result.features.into_iter().map(|feature| feature.var).collect(),
            forms: result.extensions.into_iter().map(DataForm::from).collect(),
        }
    }
}

pub fn build_info_query(id: &str, to: Jid) -> Iq {
    Iq::from_get(id, DiscoInfoQuery { node: None }).with_to(to)
}

pub fn build_items_query(id: &str, to: Jid) -> Iq {
    Iq::from_get(id, DiscoItemsQuery { node: None, rsm: None }).with_to(to)
}

/// Return the `<query/>` payload of a successful reply, or the error the
/// service answered with.
fn query_payload<'a>(reply: &'a Stanza, ns: &str) -> Result<&'a Element, ChatError> {
    if let Some(error) = reply.error() {
        return Err(ChatError::protocol(error.condition, error.text));
    }
    let Stanza::Iq(iq) = reply else {
        return Err(ChatError::MalformedReply(format!(
            "expected iq result, got <{}/>",
            reply.name()
        )));
    };
    match &iq.payload {
        IqType::Result(Some(payload)) if payload.is("query", ns) => Ok(payload),
        IqType::Result(_) => Err(ChatError::MalformedReply(format!(
            "result carries no <query xmlns='{ns}'/>"
        ))),
        _ => Err(ChatError::MalformedReply(
            "expected iq result, got a request".to_string(),
        )),
    }
}

pub fn parse_items_result(reply: &Stanza) -> Result<Vec<RoomItem>, ChatError> {
    let query = query_payload(reply, ns::DISCO_ITEMS)?;
    let result = DiscoItemsResult::try_from(query.clone()).map_err(|error| {
        ChatError::MalformedReply(format!("invalid disco#items result: {error}"))
    })?;
    Ok(result.items.into_iter().map(RoomItem::from).collect())
}

pub fn parse_info_result(reply: &Stanza) -> Result<DiscoInfo, ChatError> {
    let query = query_payload(reply, ns::DISCO_INFO)?;
    match DiscoInfoResult::try_from(query.clone()) {
        Ok(result) => Ok(DiscoInfo::from(result)),
        Err(error) => {
            debug!(%error, "reading disco#info result leniently");
            Ok(lenient_info(query))
        }
    }
}

/// Keep every child that parses on its own. Rooms in the wild send replies
/// without identities or with forms lacking a `FORM_TYPE`, which the strict
/// result parser refuses as a whole.
fn lenient_info(query: &Element) -> DiscoInfo {
    let mut info = DiscoInfo::default();
    for child in query.children() {
        if child.is("identity", ns::DISCO_INFO) {
            if let Ok(identity) = xep0030::Identity::try_from(child.clone()) {
                info.identities.push(identity.into());
            }
        } else if child.is("feature", ns::DISCO_INFO) {
            if let Ok(feature) = xep0030::Feature::try_from(child.clone()) {
                info.features.push(feature.var);
            }
        } else if child.is("x", ns::DATA_FORMS) {
            match data_forms::DataForm::try_from(child.clone()) {
                Ok(form) if form.type_ == DataFormType::Result_ => info.forms.push(form.into()),
                Ok(_) => {}
                Err(error) => debug!(%error, "skipping unreadable data form"),
            }
        }
    }
    info
}

fn fallback_name(jid: &Jid) -> String {
    jid.node()
        .map(|node| node.to_string())
        .unwrap_or_else(|| jid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn reply(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("reply should parse")
    }

    fn jid(address: &str) -> Jid {
        Jid::new(address).unwrap()
    }

    #[test]
    fn query_addresses_target() {
        let iq = build_items_query("abc", jid("conference.example.org"));
        assert_eq!(iq.id, "abc");
        assert_eq!(iq.to, Some(jid("conference.example.org")));
        assert_matches!(&iq.payload, IqType::Get(query) if query.is("query", ns::DISCO_ITEMS));

        let iq = build_info_query("def", jid("lobby@conference.example.org"));
        assert_matches!(&iq.payload, IqType::Get(query) if query.is("query", ns::DISCO_INFO));
    }

    #[test]
    fn items_keep_order_and_fall_back_to_local_part() {
        let rooms = parse_items_result(&reply(
            "<iq xmlns='jabber:client' type='result' id='a' from='conference.example.org'>\
             <query xmlns='http://jabber.org/protocol/disco#items'>\
             <item jid='lobby@conference.example.org' name='Lobby'/>\
             <item jid='dev@conference.example.org'/>\
             <item jid='ops@conference.example.org' name=' '/>\
             </query></iq>",
        ))
        .unwrap();

        assert_eq!(
            rooms.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            ["Lobby", "dev", "ops"]
        );
        assert_eq!(rooms[1].jid, "dev@conference.example.org");
        assert!(rooms.iter().all(|room| room.description.is_none()));
    }

    #[test]
    fn item_without_jid_makes_the_listing_malformed() {
        let result = parse_items_result(&reply(
            "<iq xmlns='jabber:client' type='result' id='a' from='conference.example.org'>\
             <query xmlns='http://jabber.org/protocol/disco#items'>\
             <item jid='lobby@conference.example.org' name='Lobby'/>\
             <item name='orphan'/>\
             </query></iq>",
        ));
        assert_matches!(result, Err(ChatError::MalformedReply(_)));
    }

    #[test]
    fn empty_listing_is_ok() {
        let rooms = parse_items_result(&reply(
            "<iq xmlns='jabber:client' type='result' id='a'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>",
        ))
        .unwrap();
        assert!(rooms.is_empty());
    }

    #[test]
    fn error_reply_becomes_protocol_error() {
        let result = parse_items_result(&reply(
            "<iq xmlns='jabber:client' type='error' id='a'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        ));
        assert_matches!(
            result,
            Err(ChatError::Protocol { condition, text: None }) if condition == "item-not-found"
        );
    }

    #[test]
    fn result_without_query_is_malformed() {
        assert_matches!(
            parse_items_result(&reply("<iq xmlns='jabber:client' type='result' id='a'/>")),
            Err(ChatError::MalformedReply(_))
        );
        assert_matches!(
            parse_info_result(&reply(
                "<iq xmlns='jabber:client' type='result' id='a'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>"
            )),
            Err(ChatError::MalformedReply(_))
        );
    }

    #[test]
    fn presence_is_not_a_disco_reply() {
        assert_matches!(
            parse_info_result(&reply(
                "<presence xmlns='jabber:client' from='lobby@conference.example.org/bob'/>"
            )),
            Err(ChatError::MalformedReply(_))
        );
    }

    #[test]
    fn info_collects_identities_features_and_forms() {
        let info = parse_info_result(&reply(
            "<iq xmlns='jabber:client' type='result' id='b'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='conference' type='text' name='Lobby'/>\
             <feature var='http://jabber.org/protocol/muc'/>\
             <feature var='muc_open'/>\
             <x xmlns='jabber:x:data' type='result'>\
             <field var='FORM_TYPE' type='hidden'><value>http://jabber.org/protocol/muc#roominfo</value></field>\
             <field var='muc#roominfo_occupants'><value>3</value></field>\
             <field var='muc#roominfo_contactjid'><value>a@example.org</value><value>b@example.org</value></field>\
             </x></query></iq>",
        ))
        .unwrap();

        assert!(info.has_identity("conference", "text"));
        assert!(info.has_feature("http://jabber.org/protocol/muc"));
        let form = info
            .form("http://jabber.org/protocol/muc#roominfo")
            .expect("roominfo form");
        assert_eq!(form.value("muc#roominfo_occupants"), Some("3"));
        assert_eq!(form.values("muc#roominfo_contactjid").len(), 2);
        assert!(form.values("muc#roominfo_lang").is_empty());
    }

    #[test]
    fn info_without_identity_is_read_leniently() {
        let info = parse_info_result(&reply(
            "<iq xmlns='jabber:client' type='result' id='c'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <feature var='http://jabber.org/protocol/muc'/>\
             <feature/>\
             <x xmlns='jabber:x:data' type='result'>\
             <field var='muc#roominfo_subject'><value>Welcome</value></field>\
             </x></query></iq>",
        ))
        .unwrap();

        assert!(info.identities.is_empty());
        assert_eq!(info.features, ["http://jabber.org/protocol/muc"]);
        assert_eq!(info.forms.len(), 1);
        assert_eq!(info.forms[0].form_type, None);
        assert_eq!(info.forms[0].value("muc#roominfo_subject"), Some("Welcome"));
    }
}
