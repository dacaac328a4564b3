//! Message envelope
//!
//! `Envelope` is the unit exchanged over the wire in both directions:
//! publishers send them, subscribers receive them. It is encoded as a JSON
//! object and relies on WebSocket framing for boundaries, so there is no
//! length prefix.
//!
//! Notes on fields:
//! - `action`: `"subscribe"`, `"unsubscribe"` or `"publish"`
//! - `topic`: topic name used for routing
//! - `payload`: opaque bytes, carried as a standard base64 string; `null`
//!   decodes to an empty payload but the key itself must be present

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::utils::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
            Action::Publish => "publish",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub topic: String,
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
}

impl Envelope {
    pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            action: Action::Publish,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Subscribe,
            topic: topic.into(),
            payload: Bytes::new(),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Unsubscribe,
            topic: topic.into(),
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(RelayError::Encoding)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(RelayError::Decoding)
    }

    /// Fails with `UnexpectedAction` unless this envelope carries `expected`.
    pub fn expect_action(&self, expected: Action) -> Result<()> {
        if self.action == expected {
            Ok(())
        } else {
            Err(RelayError::UnexpectedAction {
                expected,
                got: self.action,
            })
        }
    }
}

mod base64_payload {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Bytes::new()),
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(D::Error::custom),
        }
    }
}
