//! Duplex relay between a session's PTY and its transport.
//!
//! Two flows run concurrently on the same task:
//!
//! - **output**: PTY → transport. Polls the device with a bounded timeout and
//!   sends each chunk as an `output` frame, awaiting the send before polling
//!   again so at most one chunk is ever in flight.
//! - **input**: transport → PTY. Writes `input` frames verbatim and applies
//!   `resize` frames. Bad frames are dropped and the flow keeps going.
//!
//! The first flow to finish ends the relay; the other is dropped with it.

use crate::session::{Session, SessionState};
use crate::supervisor::{Readable, Supervisor, SupervisorError};
use crate::transport::{Frame, FrameSink, FrameSource, ProtocolError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Why the relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The shell exited and all of its output was delivered.
    EndOfStream,
    /// The client closed the transport or it failed.
    TransportClosed,
    /// Reading or writing the device failed.
    Io(SupervisorError),
}

/// Run both flows until one of them ends.
pub async fn run<S, R>(
    supervisor: &Supervisor,
    session: &Session,
    sink: &mut S,
    source: &mut R,
    poll_interval: Duration,
) -> RelayEnd
where
    S: FrameSink,
    R: FrameSource,
{
    tokio::select! {
        end = output_flow(supervisor, session, sink, poll_interval) => end,
        end = input_flow(supervisor, session, source) => end,
    }
}

async fn output_flow<S: FrameSink>(
    supervisor: &Supervisor,
    session: &Session,
    sink: &mut S,
    poll_interval: Duration,
) -> RelayEnd {
    let mut decoder = Utf8Carry::default();

    loop {
        match supervisor.poll_readable(session, poll_interval).await {
            Ok(Readable::Data(bytes)) => {
                trace!(session_id = %session.id(), len = bytes.len(), "PTY output");
                let text = decoder.decode(&bytes);
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = sink.send(Frame::output(text)).await {
                    debug!(session_id = %session.id(), "Output send failed: {e}");
                    return RelayEnd::TransportClosed;
                }
            }
            Ok(Readable::Idle) => {}
            Ok(Readable::EndOfStream) => {
                let rest = decoder.finish();
                if !rest.is_empty() && sink.send(Frame::output(rest)).await.is_err() {
                    return RelayEnd::TransportClosed;
                }
                session.advance(SessionState::Draining);
                debug!(session_id = %session.id(), "PTY output ended");
                return RelayEnd::EndOfStream;
            }
            Err(e) => return RelayEnd::Io(e),
        }
    }
}

async fn input_flow<R: FrameSource>(
    supervisor: &Supervisor,
    session: &Session,
    source: &mut R,
) -> RelayEnd {
    loop {
        let frame = match source.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(session_id = %session.id(), "Client closed transport");
                return RelayEnd::TransportClosed;
            }
            Err(e) if !e.is_fatal() => {
                debug!(session_id = %session.id(), "Dropping frame: {e}");
                continue;
            }
            Err(e) => {
                debug!(session_id = %session.id(), "Transport read failed: {e}");
                return RelayEnd::TransportClosed;
            }
        };

        match frame {
            Frame::Input { data } => {
                if let Err(e) = supervisor.write(session, data.as_bytes()).await {
                    if supervisor.is_alive(session) {
                        return RelayEnd::Io(e);
                    }
                    // The output flow will report the end of stream
                    debug!(session_id = %session.id(), "Shell gone, dropping input");
                }
            }
            Frame::Resize { cols, rows } => {
                if let Err(e) = supervisor.resize(session, cols, rows).await {
                    warn!(session_id = %session.id(), "Resize failed: {e}");
                }
            }
            other => {
                let e = ProtocolError::Unexpected(other.kind());
                debug!(session_id = %session.id(), "Dropping frame: {e}");
            }
        }
    }
}

/// Lossy UTF-8 decoding that never splits a character across chunks.
///
/// An incomplete sequence at the end of a chunk is held back and
/// prepended to the next one. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    } else {
                        rest = after;
                        break;
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is held back.
    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use std::path::Path;

    #[test]
    fn test_carry_ascii_passthrough() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn test_carry_joins_split_character() {
        let mut carry = Utf8Carry::default();
        // "é" is C3 A9
        assert_eq!(carry.decode(b"caf\xc3"), "caf");
        assert_eq!(carry.decode(b"\xa9!"), "é!");
    }

    #[test]
    fn test_carry_four_byte_character_over_three_chunks() {
        let mut carry = Utf8Carry::default();
        // U+1F600 is F0 9F 98 80
        assert_eq!(carry.decode(b"\xf0"), "");
        assert_eq!(carry.decode(b"\x9f\x98"), "");
        assert_eq!(carry.decode(b"\x80"), "\u{1f600}");
    }

    #[test]
    fn test_carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"a\xffb\xfe"), "a\u{fffd}b\u{fffd}");
    }

    #[test]
    fn test_carry_flushes_incomplete_tail_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"x\xe2\x82"), "x");
        assert_eq!(carry.finish(), "\u{fffd}");
        assert_eq!(carry.finish(), "");
    }

    async fn spawn_sh(supervisor: &Supervisor, script: &str) -> Session {
        supervisor
            .spawn(
                "relay-test".to_string(),
                Path::new("/bin/sh"),
                &["-c".to_string(), script.to_string()],
                &std::env::temp_dir(),
                std::env::vars().collect(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_delivers_output_then_ends() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh(&supervisor, "printf 'abc'").await;
        let (mut sink, mut source, mut client) = memory::pair(64);

        let end = run(
            &supervisor,
            &session,
            &mut sink,
            &mut source,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(end, RelayEnd::EndOfStream));
        assert_eq!(session.state(), SessionState::Draining);

        drop(sink);
        let mut out = String::new();
        while let Some(frame) = client.recv().await {
            if let Frame::Output { data } = frame {
                out.push_str(&data);
            }
        }
        assert_eq!(out, "abc");

        supervisor.terminate(&session, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_relay_ends_when_client_closes() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh(&supervisor, "sleep 30").await;
        let (mut sink, mut source, mut client) = memory::pair(64);

        client.close();
        let end = run(
            &supervisor,
            &session,
            &mut sink,
            &mut source,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(end, RelayEnd::TransportClosed));

        supervisor.terminate(&session, Duration::from_millis(200)).await;
    }
}
