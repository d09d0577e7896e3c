use std::str::FromStr;

use xmpp_parsers::{
    iq::{Iq, IqType},
    jid::Jid,
    message::{Message, MessageType},
    minidom::Element,
    ns,
    presence::{Presence, Type as PresenceType},
    stanza_error::StanzaError,
};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, PipelineError> {
        parse_stanza(raw)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        serialize_stanza(self)
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(message) => message.id.as_deref(),
            Stanza::Presence(presence) => presence.id.as_deref(),
            Stanza::Iq(iq) => Some(&iq.id),
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Stanza::Message(message) => message.type_ == MessageType::Error,
            Stanza::Presence(presence) => presence.type_ == PresenceType::Error,
            Stanza::Iq(iq) => matches!(iq.payload, IqType::Error(_)),
        }
    }

    /// An iq of type `result` or `error`, i.e. something that answers one of ours.
    pub fn is_iq_response(&self) -> bool {
        matches!(
            self,
            Stanza::Iq(iq) if matches!(iq.payload, IqType::Result(_) | IqType::Error(_))
        )
    }

    /// Condition and text of an error stanza.
    pub fn error(&self) -> Option<StanzaErrorInfo> {
        match self {
            Stanza::Iq(iq) => match &iq.payload {
                IqType::Error(error) => Some(StanzaErrorInfo::from(error)),
                _ => None,
            },
            Stanza::Presence(presence) if presence.type_ == PresenceType::Error => {
                Some(StanzaErrorInfo::from_payloads(&presence.payloads))
            }
            Stanza::Message(message) if message.type_ == MessageType::Error => {
                Some(StanzaErrorInfo::from_payloads(&message.payloads))
            }
            _ => None,
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = PipelineError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        parse_stanza_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        match value {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        value.to_element()
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(Box::new(iq))
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(Box::new(presence))
    }
}

/// Defined condition, optional text and legacy numeric code of a stanza error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaErrorInfo {
    pub condition: String,
    pub text: Option<String>,
    pub code: Option<String>,
}

const UNDEFINED_CONDITION: &str = "undefined-condition";

impl StanzaErrorInfo {
    /// Presence and message errors stay raw payloads after parsing. Servers
    /// still send pre-RFC errors that carry only a `code`, so those are read
    /// from the element when the typed parse refuses them.
    fn from_payloads(payloads: &[Element]) -> Self {
        let Some(error) = payloads
            .iter()
            .find(|payload| payload.is("error", ns::JABBER_CLIENT))
        else {
            return Self::undefined(None);
        };
        let code = error.attr("code").map(str::to_string);

        match StanzaError::try_from(error.clone()) {
            Ok(parsed) => Self {
                code,
                ..Self::from(&parsed)
            },
            Err(_) => Self::undefined(code),
        }
    }

    fn undefined(code: Option<String>) -> Self {
        Self {
            condition: UNDEFINED_CONDITION.to_string(),
            text: None,
            code,
        }
    }
}

impl From<&StanzaError> for StanzaErrorInfo {
    fn from(error: &StanzaError) -> Self {
        let condition = Element::from(error.defined_condition.clone());
        let text = error
            .texts
            .get("")
            .or_else(|| error.texts.values().next())
            .filter(|text| !text.trim().is_empty())
            .cloned();
        Self {
            condition: condition.name().to_string(),
            text,
            code: None,
        }
    }
}

pub fn parse_stanza(raw: &[u8]) -> Result<Stanza, PipelineError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        PipelineError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::ParseFailed(
            "stanza payload is empty".to_string(),
        ));
    }

    let element = Element::from_str(trimmed).map_err(|error| {
        PipelineError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })?;
    parse_stanza_element(element)
}

pub fn serialize_stanza(stanza: &Stanza) -> Result<Vec<u8>, PipelineError> {
    let element = stanza.to_element();
    let mut payload = Vec::new();
    element.write_to(&mut payload).map_err(|error| {
        PipelineError::SerializeFailed(format!(
            "failed to serialize <{}/> stanza: {error}",
            stanza.name()
        ))
    })?;
    Ok(payload)
}

fn parse_stanza_element(element: Element) -> Result<Stanza, PipelineError> {
    match element.name() {
        "message" => Message::try_from(element)
            .map(|message| Stanza::Message(Box::new(message)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <message/> stanza: {error}"))
            }),
        "presence" => Presence::try_from(element)
            .map(|presence| Stanza::Presence(Box::new(presence)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <presence/> stanza: {error}"))
            }),
        "iq" => Iq::try_from(element)
            .map(|iq| Stanza::Iq(Box::new(iq)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <iq/> stanza: {error}"))
            }),
        other => Err(PipelineError::Unsupported(format!(
            "unsupported stanza element <{other}/>"
        ))),
    }
}
