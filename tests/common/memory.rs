//! In-process [`Connector`] whose server side is driven by the test.

use async_trait::async_trait;
use dashlink::ws::error::WsError;
use dashlink::ws::{CloseFrame, Connector, Frame, FrameSink, FrameStream};
use futures::channel::mpsc as frame_channel;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, oneshot};

/// Every `connect` call surfaces on the paired [`MemoryListener`] as a [`PendingConnection`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pending: mpsc::UnboundedSender<PendingConnection>,
}

#[derive(Debug)]
pub struct MemoryListener {
    pending: mpsc::UnboundedReceiver<PendingConnection>,
}

type Handshake = Result<(FrameSink, FrameStream), WsError>;

/// A connection attempt waiting for the listener's decision.
pub struct PendingConnection {
    url: String,
    responder: oneshot::Sender<Handshake>,
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Server side of an accepted connection. Dropping it ends the client's stream without a close
/// frame.
#[derive(Debug)]
pub struct MemoryPeer {
    outgoing: frame_channel::UnboundedSender<Result<Frame, WsError>>,
    incoming: frame_channel::UnboundedReceiver<Frame>,
}

impl MemoryConnector {
    #[must_use]
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (pending, rx) = mpsc::unbounded_channel();
        (Self { pending }, MemoryListener { pending: rx })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), WsError> {
        let (responder, decision) = oneshot::channel();
        self.pending
            .send(PendingConnection {
                url: url.to_owned(),
                responder,
            })
            .map_err(|_e| WsError::Refused("listener dropped".to_owned()))?;

        decision
            .await
            .map_err(|_e| WsError::Refused("connection abandoned".to_owned()))?
    }
}

impl MemoryListener {
    pub async fn next(&mut self) -> Option<PendingConnection> {
        self.pending.recv().await
    }
}

impl PendingConnection {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn accept(self) -> MemoryPeer {
        let (client_tx, peer_rx) = frame_channel::unbounded::<Frame>();
        let (peer_tx, client_rx) = frame_channel::unbounded::<Result<Frame, WsError>>();

        let sink: FrameSink = Box::pin(client_tx.sink_map_err(|_e| WsError::ConnectionClosed));
        let stream: FrameStream = Box::pin(client_rx);
        _ = self.responder.send(Ok((sink, stream)));

        MemoryPeer {
            outgoing: peer_tx,
            incoming: peer_rx,
        }
    }

    pub fn refuse<S: Into<String>>(self, reason: S) {
        _ = self.responder.send(Err(WsError::Refused(reason.into())));
    }
}

impl MemoryPeer {
    /// Returns `false` once the client is gone.
    pub fn send_text<S: Into<String>>(&self, text: S) -> bool {
        self.outgoing
            .unbounded_send(Ok(Frame::Text(text.into())))
            .is_ok()
    }

    pub fn close<S: Into<String>>(&self, code: u16, reason: S) -> bool {
        self.outgoing
            .unbounded_send(Ok(Frame::Close(Some(CloseFrame::new(code, reason)))))
            .is_ok()
    }

    /// Fail the client's stream with a transport error.
    pub fn fail(&self) -> bool {
        self.outgoing
            .unbounded_send(Err(WsError::ConnectionClosed))
            .is_ok()
    }

    /// Next frame written by the client, `None` once the client dropped its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.next().await
    }
}
