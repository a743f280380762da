//! [`Connector`] implementations.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::error::WsError;
use super::traits::{CloseFrame, Connector, Frame, FrameSink, FrameStream};

/// Connects over the network with `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close(close) => Message::Close(close.map(|close| WireCloseFrame {
                code: CloseCode::from(close.code),
                reason: close.reason.into(),
            })),
        }
    }
}

fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Close(close) => Some(Frame::Close(close.map(|close| {
            CloseFrame::new(u16::from(close.code), close.reason.as_str())
        }))),
        // Protocol pings are answered by tungstenite; binary frames are not part of the envelope
        _ => None,
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), WsError> {
        let (ws_stream, _) = connect_async(url).await.map_err(WsError::Connection)?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(WsError::Connection)
            .with(|frame: Frame| future::ready(Ok::<_, WsError>(Message::from(frame))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => frame_from_message(message).map(Ok),
                Err(e) => Some(Err(WsError::Connection(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
