//! Frame types and the transport seam.
//!
//! Every message on the duplex channel is one JSON object:
//!
//! ```text
//! { "type": "output" | "input" | "resize" | "error", "data": <string>, "cols"?: <int>, "rows"?: <int> }
//! ```
//!
//! The relay only ever sees [`Frame`]s through [`FrameSink`] and
//! [`FrameSource`]; the WebSocket and in-memory adapters live in the
//! submodules.

pub mod memory;
pub mod ws;

use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// One unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Terminal output, decoded as UTF-8 with lossy replacement.
    Output { data: String },

    /// Raw input for the shell, control characters included.
    Input { data: String },

    /// New terminal geometry.
    Resize { cols: u16, rows: u16 },

    /// Human-readable error, sent around session start or end.
    Error {
        #[serde(rename = "data")]
        message: String,
    },
}

impl Frame {
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Parse one envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Self = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        if let Self::Resize { cols, rows } = frame {
            if cols == 0 || rows == 0 {
                return Err(ProtocolError::InvalidGeometry { cols, rows });
            }
        }
        Ok(frame)
    }

    /// Serialize to one envelope.
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(TransportError::Encode)
    }

    /// The envelope `type` tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Output { .. } => "output",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::Error { .. } => "error",
        }
    }
}

/// A frame from the client that cannot be acted on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("binary message is not UTF-8")]
    NotText,

    #[error("invalid terminal size {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("unexpected {0} frame from client")]
    Unexpected(&'static str),
}

/// Errors from the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Recoverable: the offending frame is dropped.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),
}

impl TransportError {
    /// Whether the transport is unusable after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Outbound half of a transport.
pub trait FrameSink: Send {
    /// Send one frame. Completes once the frame has been handed to the
    /// transport, so callers that await it never queue more than one.
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the transport. Closing twice is not an error.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Inbound half of a transport.
pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` once the peer has closed, or
    /// `Err(TransportError::Protocol)` for a single bad frame.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_input() {
        let frame = Frame::decode(r#"{"type":"input","data":"ls\r"}"#).unwrap();
        assert_eq!(frame, Frame::input("ls\r"));
    }

    #[test]
    fn test_decode_control_bytes_survive() {
        let frame = Frame::decode(r#"{"type":"input","data":"\u0003\u001b[A"}"#).unwrap();
        assert_eq!(frame, Frame::input("\u{3}\u{1b}[A"));
    }

    #[test]
    fn test_decode_resize_ignores_data() {
        let frame = Frame::decode(r#"{"type":"resize","data":"","cols":120,"rows":40}"#).unwrap();
        assert_eq!(frame, Frame::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn test_decode_resize_requires_geometry() {
        let result = Frame::decode(r#"{"type":"resize","cols":120}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let result = Frame::decode(r#"{"type":"resize","cols":0,"rows":40}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidGeometry { cols: 0, rows: 40 })
        ));
    }

    #[test]
    fn test_decode_rejects_plain_text() {
        assert!(matches!(
            Frame::decode("echo hi"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(matches!(
            Frame::decode(r#"{"type":"shell","data":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_error_uses_data_field() {
        let json = Frame::error("spawn failed").encode().unwrap();
        assert_eq!(json, r#"{"type":"error","data":"spawn failed"}"#);
    }

    #[test]
    fn test_encode_output() {
        let json = Frame::output("a\r\nb").encode().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"a\r\nb"}"#);
    }

    #[test]
    fn test_protocol_errors_are_not_fatal() {
        let err = TransportError::from(ProtocolError::NotText);
        assert!(!err.is_fatal());
        assert!(TransportError::Closed.is_fatal());
    }
}
