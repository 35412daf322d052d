use crate::messages::KvMessage;

pub const FORMAT_INCORRECT: &str = "Message format incorrect";
pub const DOES_NOT_EXIST: &str = "Does not exist";

/// Every failure that can be reported to a peer. The `Display` form is the
/// exact text carried in the `Message` element of a `resp` or `abort`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("Message format incorrect")]
    Format,
    #[error("XML Error: Received unparseable message")]
    Xml,
    #[error("Oversized key")]
    OversizedKey,
    #[error("Oversized value")]
    OversizedValue,
    #[error("Unknown Error: the key is empty")]
    EmptyKey,
    #[error("Unknown Error: the value is empty")]
    EmptyValue,
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Does not exist")]
    NotFound,
    #[error("Unknown Error: {0}")]
    Protocol(String),
    #[error("Unknown Error: {0}")]
    Registration(String),
    // message relayed verbatim from another node
    #[error("{0}")]
    Remote(String),
    #[error("Unknown Error: {0}")]
    Unknown(String),
}

impl KvError {
    pub fn network(detail: impl std::fmt::Display) -> Self {
        KvError::Network(detail.to_string())
    }

    /// Builds the `resp` message sent back to whoever caused this error.
    pub fn to_response(&self) -> KvMessage {
        KvMessage::resp(self.to_string())
    }

    /// Maps the `Message` text of a peer's reply back onto a typed error.
    pub fn from_response(message: &str) -> Self {
        match message {
            DOES_NOT_EXIST => KvError::NotFound,
            FORMAT_INCORRECT => KvError::Format,
            "Oversized key" => KvError::OversizedKey,
            "Oversized value" => KvError::OversizedValue,
            other => KvError::Remote(other.to_string()),
        }
    }
}

pub type KvResult<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_strings() {
        assert_eq!(KvError::Format.to_string(), "Message format incorrect");
        assert_eq!(KvError::NotFound.to_string(), "Does not exist");
        assert_eq!(KvError::OversizedKey.to_string(), "Oversized key");
        assert_eq!(
            KvError::network("Could not connect").to_string(),
            "Network Error: Could not connect"
        );
        assert_eq!(
            KvError::Remote("@7:=Does not exist".into()).to_string(),
            "@7:=Does not exist"
        );
    }

    #[test]
    fn test_from_response_recovers_typed_errors() {
        assert_eq!(KvError::from_response("Does not exist"), KvError::NotFound);
        assert_eq!(KvError::from_response("Oversized value"), KvError::OversizedValue);
        assert_eq!(
            KvError::from_response("something else"),
            KvError::Remote("something else".into())
        );
    }

}
