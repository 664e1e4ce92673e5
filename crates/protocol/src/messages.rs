use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::types::FileMetadata;

/// JSON control message carried in a text frame on a peer data channel.
///
/// Serialized with a `type` discriminant, e.g.
/// `{"type":"requestChunks","index":64}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Receiver asks for the file's name, size and type.
    RequestMetadata,
    /// Sender answers a metadata request.
    Metadata { metadata: FileMetadata },
    /// Receiver asks for the block starting at `index`.
    RequestChunks { index: u32 },
}

impl ControlMessage {
    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestMetadata => "requestMetadata",
            Self::Metadata { .. } => "metadata",
            Self::RequestChunks { .. } => "requestChunks",
        }
    }
}
