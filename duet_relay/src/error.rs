// Error taxonomy for the relay core.
//
// Registry and pairing errors are local decisions returned to the relay loop;
// transport errors describe a dead or stalled socket. Every variant maps to a
// wire `StatusCode` so the relay loop can turn any failure into a Status
// frame for the originating client.

use duet_protocol::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("nickname {0:?} is already online")]
    AlreadyExists(String),

    #[error("nickname {0:?} was never registered")]
    NotFound(String),

    #[error("invalid nickname: {0}")]
    InvalidNickname(String),
}

impl RegistrationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::InvalidNickname(_) => StatusCode::InvalidNickname,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("{0} is offline or does not exist")]
    PeerOffline(String),

    #[error("{0} is already in a room")]
    AlreadyPaired(String),

    #[error("cannot pair {0} with itself")]
    SelfPairing(String),

    #[error("no peer is available to pair with")]
    NoPeerAvailable,
}

impl PairingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PeerOffline(_) | Self::NoPeerAvailable => StatusCode::PeerOffline,
            Self::AlreadyPaired(_) => StatusCode::AlreadyPaired,
            Self::SelfPairing(_) => StatusCode::SelfPairing,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("send timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    Oversized(usize),
}

impl TransportError {
    /// Whether the socket itself failed. `false` means the frame could not
    /// be built, which is no fault of the receiving client.
    pub fn is_transport_failure(&self) -> bool {
        !matches!(self, Self::Encode(_) | Self::Oversized(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("not in a room")]
    NotPaired,

    #[error("payload cannot be relayed: {0}")]
    Undeliverable(#[source] TransportError),

    #[error("send to {peer} failed: {source}")]
    SendFailed {
        peer: String,
        #[source]
        source: TransportError,
    },
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotPaired => StatusCode::NotPaired,
            Self::Undeliverable(_) => StatusCode::InvalidFrame,
            Self::SendFailed { .. } => StatusCode::PeerLeft,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn io_kinds_classified() {
        let timeout: TransportError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(timeout, TransportError::Timeout));
        let timeout: TransportError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(timeout, TransportError::Timeout));
        let closed: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(closed, TransportError::Closed));
        let other: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, TransportError::Io(_)));
        assert!(other.is_transport_failure());
        assert!(!TransportError::Oversized(usize::MAX).is_transport_failure());
    }

    #[test]
    fn no_peer_reports_peer_offline() {
        assert_eq!(
            PairingError::NoPeerAvailable.status_code(),
            StatusCode::PeerOffline
        );
        assert_eq!(
            RegistrationError::AlreadyExists("alice".into()).status_code(),
            StatusCode::AlreadyExists
        );
    }
}
