//! WebSocket transport.
//!
//! Frames travel as text messages. Binary messages are accepted when they
//! carry a UTF-8 envelope; ping/pong are answered by tungstenite itself.

use super::{Frame, FrameSink, FrameSource, ProtocolError, TransportError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Outbound half of a WebSocket connection.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Inbound half of a WebSocket connection.
pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an upgraded connection into frame halves.
pub fn split<S>(stream: WebSocketStream<S>) -> (WsSink<S>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = stream.split();
    (WsSink { inner: sink }, WsSource { inner: source })
}

fn map_ws_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        e => TransportError::WebSocket(e),
    }
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let text = frame.encode()?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await.map_err(map_ws_error) {
            Err(TransportError::Closed) => Ok(()),
            other => other,
        }
    }
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let Some(message) = self.inner.next().await else {
                return Ok(None);
            };
            match message.map_err(map_ws_error) {
                Ok(Message::Text(text)) => {
                    return Frame::decode(&text)
                        .map(Some)
                        .map_err(TransportError::Protocol);
                }
                Ok(Message::Binary(bytes)) => {
                    let text = String::from_utf8(bytes).map_err(|_| ProtocolError::NotText)?;
                    return Frame::decode(&text)
                        .map(Some)
                        .map_err(TransportError::Protocol);
                }
                Ok(Message::Close(close)) => {
                    debug!(?close, "Peer sent close");
                    return Ok(None);
                }
                // Ping, pong and raw frames carry nothing for us
                Ok(_) => {}
                Err(TransportError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
