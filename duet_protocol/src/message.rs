// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by clients to the relay.
// - `ServerMessage`: sent by the relay to clients.
//
// Relay payloads are opaque bytes (`Vec<u8>`). The relay copies them into a
// `ServerMessage::Message` addressed to the partner without looking inside.

use serde::{Deserialize, Serialize};

use crate::types::StatusCode;

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Claim a nickname. Reactivates an offline nickname as well.
    Register { nickname: String },
    /// Reclaim a nickname that was registered before and is now offline.
    Login { nickname: String },
    /// Ask for a room. `None` means "match me with anyone available".
    Join { peer: Option<String> },
    /// Opaque payload for the current partner.
    Relay { payload: Vec<u8> },
    /// Dissolve the current room but stay connected.
    Leave,
    /// Ask who else is online.
    ListOnline,
    /// Go offline and close the connection. The nickname stays reserved
    /// for a later `Login`.
    Logout,
    /// Give up the nickname entirely and close the connection.
    Deregister,
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Outcome of a request, or an unsolicited room change (`Joined`,
    /// `PeerLeft`). `peer` is set when the status concerns a partner.
    Status {
        code: StatusCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
    /// A payload relayed verbatim from the partner.
    Message { from: String, payload: Vec<u8> },
    /// Answer to `ListOnline`. Excludes the asking client.
    Online { peers: Vec<PeerInfo> },
}

impl ServerMessage {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
            peer: None,
        }
    }

    pub fn peer_status(code: StatusCode, message: impl Into<String>, peer: &str) -> Self {
        Self::Status {
            code,
            message: message.into(),
            peer: Some(peer.to_owned()),
        }
    }

    /// The status code, if this is a `Status` frame.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// One entry of an `Online` listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub nickname: String,
    pub paired: bool,
}
