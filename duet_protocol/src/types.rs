// Shared value types for the Duet protocol.
//
// `StatusCode` is the machine-readable half of every `ServerMessage::Status`
// frame. Clients match on it; the accompanying text is for humans only.
//
// Nickname validation lives here rather than in the relay so that clients
// can reject a bad nickname before connecting.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default upper bound on nickname length, in characters.
pub const DEFAULT_MAX_NICKNAME_LEN: usize = 32;

/// Outcome codes carried by `ServerMessage::Status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Registration or login accepted.
    Registered,
    /// The nickname is held by an online session.
    AlreadyExists,
    /// `Login` named a nickname that was never registered.
    NotFound,
    /// Nickname is empty, too long, or contains whitespace/control chars.
    InvalidNickname,
    /// A room was formed; `peer` names the partner.
    Joined,
    /// The requested peer is not online (or nobody is available to match).
    PeerOffline,
    /// One side of the requested pairing already has a room.
    AlreadyPaired,
    /// A client asked to pair with itself.
    SelfPairing,
    /// The room was dissolved; `peer` names the former partner.
    PeerLeft,
    /// A relay frame arrived while not in a room.
    NotPaired,
    /// The frame could not be decoded or was not valid in this state.
    InvalidFrame,
    /// A session command arrived before registration.
    NotRegistered,
    /// Acknowledges `Logout`; the connection closes next.
    LoggedOut,
    /// Acknowledges `Deregister`; the nickname is free for anyone.
    Deregistered,
    /// The relay is configured not to offer this operation.
    Unsupported,
}

impl StatusCode {
    /// Whether the code reports a failure rather than a state change.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            Self::Registered | Self::Joined | Self::PeerLeft | Self::LoggedOut | Self::Deregistered
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a nickname was rejected by `validate_nickname`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NicknameProblem {
    Empty,
    TooLong { max: usize },
    IllegalChar(char),
}

impl fmt::Display for NicknameProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "nickname is empty"),
            Self::TooLong { max } => write!(f, "nickname is longer than {max} characters"),
            Self::IllegalChar(c) => write!(f, "nickname contains illegal character {c:?}"),
        }
    }
}

/// Check a nickname against the relay's naming rules.
pub fn validate_nickname(nickname: &str, max_len: usize) -> Result<(), NicknameProblem> {
    if nickname.is_empty() {
        return Err(NicknameProblem::Empty);
    }
    if nickname.chars().count() > max_len {
        return Err(NicknameProblem::TooLong { max: max_len });
    }
    if let Some(c) = nickname
        .chars()
        .find(|c| c.is_whitespace() || c.is_control())
    {
        return Err(NicknameProblem::IllegalChar(c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_nickname() {
        assert_eq!(validate_nickname("alice", DEFAULT_MAX_NICKNAME_LEN), Ok(()));
        assert_eq!(validate_nickname("élan_42", DEFAULT_MAX_NICKNAME_LEN), Ok(()));
    }

    #[test]
    fn rejects_empty_and_long() {
        assert_eq!(validate_nickname("", 8), Err(NicknameProblem::Empty));
        assert_eq!(
            validate_nickname("abcdefghi", 8),
            Err(NicknameProblem::TooLong { max: 8 })
        );
        // Length counts characters, not bytes.
        assert_eq!(validate_nickname("ééééé", 5), Ok(()));
    }

    #[test]
    fn rejects_whitespace_and_control() {
        assert_eq!(
            validate_nickname("bob smith", 32),
            Err(NicknameProblem::IllegalChar(' '))
        );
        assert_eq!(
            validate_nickname("bob\n", 32),
            Err(NicknameProblem::IllegalChar('\n'))
        );
    }

    #[test]
    fn error_codes_classified() {
        assert!(!StatusCode::Joined.is_error());
        assert!(!StatusCode::PeerLeft.is_error());
        assert!(StatusCode::PeerOffline.is_error());
        assert!(StatusCode::NotPaired.is_error());
    }
}
