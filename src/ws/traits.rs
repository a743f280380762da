//! Core traits for the WebSocket transport seam.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use super::error::WsError;

/// Frames exchanged with the transport, stripped of protocol-level ping/pong and binary data.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseFrame>),
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Write half of an open connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = WsError> + Send>>;
/// Read half of an open connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, WsError>> + Send>>;

/// Opens transport connections for the connection manager.
///
/// The manager owns timeouts, reconnection and heartbeat; an implementation only has to perform
/// the handshake and split the connection into its two halves.
///
/// # Example
///
/// ```ignore
/// struct Loopback;
///
/// #[async_trait]
/// impl Connector for Loopback {
///     async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), WsError> {
///         let (sink, stream) = open_somehow(url).await?;
///         Ok((Box::pin(sink), Box::pin(stream)))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), WsError>;
}
