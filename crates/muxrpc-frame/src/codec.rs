use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Body serialization format, fixed per connection at handshake.
///
/// The codec only ever sees body bytes; framing is handled by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// `application/json`.
    Json,
    /// `application/bincode`, the compact binary default. Also accepted as
    /// `application/gob`.
    #[default]
    Bincode,
    /// `application/msgpack`, map-encoded structs.
    MsgPack,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Json, Codec::Bincode, Codec::MsgPack];

    /// Canonical identifier sent in the handshake.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Bincode => "application/bincode",
            Self::MsgPack => "application/msgpack",
        }
    }

    /// Serialize a value into body bytes.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::Bincode => bincode::serialize(value)?,
            Self::MsgPack => rmp_serde::to_vec_named(value)?,
        })
    }

    /// Deserialize body bytes into a value.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::Bincode => bincode::deserialize(bytes)?,
            Self::MsgPack => rmp_serde::from_slice(bytes)?,
        })
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application/json" | "json" => Ok(Self::Json),
            "application/bincode" | "application/gob" | "bincode" | "gob" => Ok(Self::Bincode),
            "application/msgpack" | "msgpack" => Ok(Self::MsgPack),
            _ => Err(CodecError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}
