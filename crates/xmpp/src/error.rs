use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("unsupported stanza: {0}")]
    Unsupported(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

/// Failure of a discovery or room operation performed through a
/// [`ChatContext`](crate::ChatContext).
///
/// Cloneable so that a single connection loss can be delivered to every
/// outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("server returned {condition}{}", detail(.text))]
    Protocol {
        condition: String,
        text: Option<String>,
    },

    #[error("nickname already in use")]
    NicknameConflict,

    #[error("not allowed to enter the room")]
    Forbidden,

    #[error("room requires registration")]
    RegistrationRequired,

    #[error("room requires a password")]
    PasswordRequired,

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("could not encode stanza: {0}")]
    Encoding(String),

    #[error("invalid address: {0}")]
    InvalidJid(String),

    #[error("canceled")]
    Canceled,
}

impl ChatError {
    pub(crate) fn protocol(condition: impl Into<String>, text: Option<String>) -> Self {
        Self::Protocol {
            condition: condition.into(),
            text,
        }
    }
}

fn detail(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_display_includes_text_when_present() {
        let bare = ChatError::protocol("item-not-found", None);
        assert_eq!(bare.to_string(), "server returned item-not-found");

        let with_text = ChatError::protocol("forbidden", Some("members only".into()));
        assert_eq!(with_text.to_string(), "server returned forbidden: members only");
    }

    #[test]
    fn outbound_encoding_failure_is_not_a_reply_problem() {
        let error = ChatError::Encoding("failed to serialize <iq/> stanza".into());
        assert_eq!(
            error.to_string(),
            "could not encode stanza: failed to serialize <iq/> stanza"
        );
        assert_ne!(error, ChatError::MalformedReply("failed to serialize <iq/> stanza".into()));
    }
}
