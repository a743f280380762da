#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::Kind;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// The peer refused the connection attempt. Reported by custom [`Connector`](super::Connector)s
    Refused(String),
    /// The transport went away underneath a custom [`Connector`](super::Connector)
    ConnectionClosed,
    /// The handshake did not finish within the connect timeout
    Timeout,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::Refused(reason) => write!(f, "WebSocket connection refused: {reason}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Timeout => write!(f, "WebSocket connection attempt timed out"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

impl WsError {
    /// The crate-level [`Kind`] this error maps onto.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Connection(_) | Self::Refused(_) | Self::ConnectionClosed => Kind::Transport,
            Self::Timeout => Kind::Timeout,
            Self::MessageParse(_) => Kind::Parse,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(e.kind(), e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(WsError::ConnectionClosed.kind(), Kind::Transport);
        assert_eq!(WsError::Timeout.kind(), Kind::Timeout);

        let error: crate::error::Error = WsError::Refused("busy".to_owned()).into();
        assert_eq!(error.kind(), Kind::Transport);
        assert!(error.to_string().contains("busy"), "reason should be kept");
    }
}
