//! In-process transport over bounded channels.
//!
//! Carries the same JSON text a WebSocket would, so the server half
//! exercises the real frame codec. Useful for embedding and tests.

use super::{Frame, FrameSink, FrameSource, TransportError};
use tokio::sync::mpsc;

/// Server-side outbound half.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

/// Server-side inbound half.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<String>,
}

/// The peer of a [`MemorySink`]/[`MemorySource`] pair.
#[derive(Debug)]
pub struct MemoryClient {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Create a connected transport. `capacity` bounds each direction.
#[must_use]
pub fn pair(capacity: usize) -> (MemorySink, MemorySource, MemoryClient) {
    let (to_client, from_server) = mpsc::channel(capacity);
    let (to_server, from_client) = mpsc::channel(capacity);
    (
        MemorySink {
            tx: Some(to_client),
        },
        MemorySource { rx: from_client },
        MemoryClient {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let text = frame.encode()?;
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(text) => Frame::decode(&text)
                .map(Some)
                .map_err(TransportError::Protocol),
            None => Ok(None),
        }
    }
}

impl MemoryClient {
    /// Send a frame to the server.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_raw(frame.encode()?).await
    }

    /// Send arbitrary text, well-formed or not.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text.into())
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next frame from the server, `None` once the server has closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let text = self.rx.recv().await?;
            match Frame::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!("Dropping undecodable server frame: {e}"),
            }
        }
    }

    /// Hang up the client-to-server direction.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut sink, mut source, mut client) = pair(4);

        client.send(&Frame::input("ls\n")).await.unwrap();
        assert_eq!(source.recv().await.unwrap(), Some(Frame::input("ls\n")));

        sink.send(Frame::output("file\r\n")).await.unwrap();
        assert_eq!(client.recv().await, Some(Frame::output("file\r\n")));
    }

    #[tokio::test]
    async fn test_malformed_is_protocol_error() {
        let (_sink, mut source, client) = pair(4);
        client.send_raw("not json").await.unwrap();
        let err = source.recv().await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_is_observed() {
        let (mut sink, mut source, mut client) = pair(4);

        client.close();
        assert_eq!(source.recv().await.unwrap(), None);

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(client.recv().await, None);
        assert!(matches!(
            sink.send(Frame::output("late")).await,
            Err(TransportError::Closed)
        ));
    }
}
