use serde::Deserialize;

use crate::errors::EnvelopeError;
use crate::ids::UserId;

/// Routing class of an envelope. Encoded on the wire as `1` / `2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum MessageKind {
    Direct,
    Group,
}

impl TryFrom<u8> for MessageKind {
    type Error = EnvelopeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(Self::Direct),
            2 => Ok(Self::Group),
            other => Err(EnvelopeError::UnknownKind(other)),
        }
    }
}

/// Attachment class of an envelope. Only routing depends on the envelope, so
/// codes newer clients introduce pass through as [`MediaKind::Other`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "u8")]
pub enum MediaKind {
    #[default]
    Text,
    File,
    Other(u8),
}

impl From<u8> for MediaKind {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Self::Text,
            2 => Self::File,
            other => Self::Other(other),
        }
    }
}

/// One chat message as exchanged with clients, carried across the relay and
/// kept verbatim in history.
///
/// Field names follow the existing HiChat web client (`userId`, `targetId`,
/// `Type`, `Media`, `Content`, `url`, `Desc`); lowercase aliases are accepted
/// on input.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "userId")]
    pub from_id: UserId,
    /// User id for direct messages, group id for group messages.
    #[serde(rename = "targetId")]
    pub target_id: u64,
    #[serde(rename = "Type", alias = "type")]
    pub kind: MessageKind,
    #[serde(rename = "Media", alias = "media", default)]
    pub media: MediaKind,
    #[serde(rename = "Content", alias = "content", default)]
    pub content: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "Desc", alias = "desc", default)]
    pub description: String,
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// The direct recipient. Only meaningful when `kind` is `Direct`.
    pub fn target_user(&self) -> UserId {
        UserId::new(self.target_id)
    }
}
