// Copyright 2024 BES Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The connection-scoped PPT session state machine: handshake, steady-state
//! send/receive, and close. Built on the codec in `ppt_protocol` and the
//! `Transport` abstraction in `crate::socket`.

use std::{
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use ppt_protocol::{
    format_extensions, handshake, parse_extensions, read_header, write_header, ChunkKind, ExtensionMap,
    PptError,
};

use crate::{consts::DEFAULT_HANDSHAKE_TIMEOUT_SECS, error::BesError, socket::Transport};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Fresh,
    AwaitingHello,
    Connected,
    Closing,
    Closed,
}

/// Result of one `receive()` call: the decoded extensions (empty if none
/// arrived this call), whether the logical message is complete, and how
/// many payload bytes were written to the caller's sink.
pub struct ReceiveOutcome {
    pub extensions: ExtensionMap,
    pub done: bool,
    pub bytes_written: usize,
}

pub struct Session<T: Transport> {
    transport: T,
    state: State,
    handshake_timeout: Duration,
    broken_pipe: AtomicBool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session {
            transport,
            state: State::Fresh,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            broken_pipe: AtomicBool::new(false),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Sets the flag an external `SIGPIPE` handler uses to suppress further
    /// writes; see spec §4.4's broken-pipe flag and §5's signal policy.
    pub fn mark_broken_pipe(&self) {
        self.broken_pipe.store(true, Ordering::SeqCst);
    }

    fn is_broken_pipe(&self) -> bool {
        self.broken_pipe.load(Ordering::SeqCst)
    }

    /// Polls the transport for readability in one-second ticks, up to
    /// `handshake_timeout`, failing `HandshakeTimeout` if none of the ticks
    /// see the socket become readable.
    fn wait_readable(&self) -> Result<(), BesError> {
        let ticks = self.handshake_timeout.as_secs().max(1);
        for _ in 0..ticks {
            match self.transport.poll_readable(Duration::from_secs(1)) {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => return Err(BesError::Ppt(PptError::Io(e))),
            }
        }
        Err(BesError::HandshakeTimeout)
    }

    /// Server half of the handshake: read the raw probe token, reply with
    /// `PPTSERVER_CONNECTION_OK`.
    pub fn server_handshake(&mut self) -> Result<(), BesError> {
        self.state = State::AwaitingHello;
        self.wait_readable()?;
        let mut buf = [0u8; 64];
        let n = self
            .transport
            .read(&mut buf)
            .map_err(|e| BesError::Ppt(PptError::Io(e)))?;
        if n == 0 {
            return Err(BesError::HandshakeTimeout);
        }
        let received = String::from_utf8_lossy(&buf[..n]);
        if received.trim_end_matches(['\0', '\n', '\r']) != handshake::CLIENT_TESTING_CONNECTION {
            return Err(BesError::HandshakeRejected { reason: received.to_string() });
        }
        self.transport
            .write_all(handshake::SERVER_CONNECTION_OK.as_bytes())
            .map_err(|e| BesError::Ppt(PptError::Io(e)))?;
        self.state = State::Connected;
        Ok(())
    }

    /// Client half of the handshake: send the raw probe token, poll for a
    /// reply up to `handshake_timeout`.
    pub fn client_handshake(&mut self) -> Result<(), BesError> {
        self.state = State::AwaitingHello;
        self.transport
            .write_all(handshake::CLIENT_TESTING_CONNECTION.as_bytes())
            .map_err(|e| BesError::Ppt(PptError::Io(e)))?;

        self.wait_readable()?;
        let mut buf = [0u8; 64];
        let n = self
            .transport
            .read(&mut buf)
            .map_err(|e| BesError::Ppt(PptError::Io(e)))?;
        if n == 0 {
            return Err(BesError::HandshakeTimeout);
        }
        let received = String::from_utf8_lossy(&buf[..n]).to_string();
        match received.trim_end_matches(['\0', '\n', '\r']) {
            s if s == handshake::SERVER_CONNECTION_OK => {
                self.state = State::Connected;
                Ok(())
            }
            s if s == handshake::SERVER_AUTHENTICATE => Err(BesError::InternalFatal {
                message: "server requested TLS authentication, which is not supported".into(),
            }),
            other => Err(BesError::HandshakeRejected { reason: other.to_string() }),
        }
    }

    /// Sends one message: an optional extension chunk, zero or more data
    /// chunks carrying `payload`, then a terminator.
    pub fn send(&mut self, extensions: &ExtensionMap, payload: &[u8]) -> Result<(), BesError> {
        if self.is_broken_pipe() {
            return Ok(());
        }
        if !extensions.is_empty() {
            let body = format_extensions(extensions);
            write_header(&mut self.transport, body.len(), ChunkKind::Extensions)?;
            self.transport.write_all(body.as_bytes()).map_err(PptError::Io)?;
        }
        let chunk_cap = self.transport.send_chunk_size().max(1);
        for chunk in payload.chunks(chunk_cap) {
            write_header(&mut self.transport, chunk.len(), ChunkKind::Data)?;
            self.transport.write_all(chunk).map_err(PptError::Io)?;
        }
        self.send_terminator()
    }

    fn send_terminator(&mut self) -> Result<(), BesError> {
        if self.is_broken_pipe() {
            return Ok(());
        }
        write_header(&mut self.transport, 0, ChunkKind::Data)?;
        Ok(())
    }

    /// Sends an extension-only `{"status": "exit_now"}` message followed by
    /// a separate terminator call. The two-step shape is load-bearing (spec
    /// Design Notes): do not collapse it into a single `send()`.
    pub fn send_exit(&mut self) -> Result<(), BesError> {
        if self.is_broken_pipe() {
            return Ok(());
        }
        let exts = ExtensionMap::exit_now();
        let body = format_extensions(&exts);
        write_header(&mut self.transport, body.len(), ChunkKind::Extensions)?;
        self.transport.write_all(body.as_bytes()).map_err(PptError::Io)?;
        self.send_terminator()
    }

    /// Reads one chunk's worth of the current message. A clean EOF before
    /// any header byte is synthesized as `{"status": "exit_now"}`, `done =
    /// true` — the orderly-shutdown signal the worker loop relies on.
    pub fn receive(&mut self, sink: &mut dyn Write) -> Result<ReceiveOutcome, BesError> {
        let header = match read_header(&mut self.transport) {
            Ok(h) => h,
            Err(PptError::PeerClosed) => {
                self.state = State::Closed;
                return Ok(ReceiveOutcome {
                    extensions: ExtensionMap::exit_now(),
                    done: true,
                    bytes_written: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        match header.kind {
            ChunkKind::Extensions if header.length == 0 => {
                Ok(ReceiveOutcome { extensions: ExtensionMap::new(), done: false, bytes_written: 0 })
            }
            ChunkKind::Extensions => {
                let mut body = vec![0u8; header.length];
                ppt_protocol::read_body_exact(&mut self.transport, &mut body, header.length)?;
                let text = std::str::from_utf8(&body)
                    .map_err(|_| PptError::MalformedFrame("extension body is not UTF-8".into()))?;
                let extensions = parse_extensions(text)?;
                Ok(ReceiveOutcome { extensions, done: false, bytes_written: 0 })
            }
            ChunkKind::Data if header.length == 0 => {
                Ok(ReceiveOutcome { extensions: ExtensionMap::new(), done: true, bytes_written: 0 })
            }
            ChunkKind::Data => {
                let recv_cap = self.transport.recv_chunk_size().max(1);
                let mut buf = vec![0u8; recv_cap.min(header.length)];
                let mut remaining = header.length;
                let mut total = 0usize;
                while remaining > 0 {
                    let want = remaining.min(buf.len());
                    ppt_protocol::read_body_exact(&mut self.transport, &mut buf[..want], want)?;
                    sink.write_all(&buf[..want]).map_err(PptError::Io)?;
                    remaining -= want;
                    total += want;
                }
                Ok(ReceiveOutcome { extensions: ExtensionMap::new(), done: false, bytes_written: total })
            }
        }
    }

    /// Reads a full logical message, looping `receive()` until `done`,
    /// concatenating data bytes and merging extensions (last occurrence
    /// wins across chunks, same as within one extension chunk).
    pub fn receive_message(&mut self) -> Result<(ExtensionMap, Vec<u8>), BesError> {
        let mut payload = Vec::new();
        let mut extensions = ExtensionMap::new();
        loop {
            let outcome = self.receive(&mut payload)?;
            for (k, v) in outcome.extensions.iter() {
                extensions.insert(k.to_string(), v.map(str::to_string));
            }
            if outcome.done {
                return Ok((extensions, payload));
            }
        }
    }

    /// Sends the exit signal if connected and not broken-pipe, then closes
    /// the transport. Idempotent.
    pub fn close(&mut self) -> Result<(), BesError> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closing;
        if !self.is_broken_pipe() {
            let _ = self.send_exit();
        }
        self.transport.close().map_err(PptError::Io)?;
        self.state = State::Closed;
        Ok(())
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::socket::Transport;

    struct PairedBuffer {
        read_from: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl io::Read for PairedBuffer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read_from.read(buf)
        }
    }

    impl Write for PairedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for PairedBuffer {
        fn recv_chunk_size(&self) -> usize {
            4096
        }
        fn send_chunk_size(&self) -> usize {
            4096
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn peer_description(&self) -> String {
            "test".into()
        }
        fn poll_readable(&self, _timeout: Duration) -> io::Result<bool> {
            Ok(true)
        }
    }

    fn harness(incoming: Vec<u8>) -> Session<PairedBuffer> {
        Session::new(PairedBuffer { read_from: Cursor::new(incoming), written: Vec::new() })
    }

    #[test]
    fn receive_synthesizes_exit_now_on_clean_eof() {
        let mut session = harness(Vec::new());
        let outcome = session.receive(&mut Vec::new()).expect("receive to succeed");
        assert!(outcome.done);
        assert!(outcome.extensions.is_exit_now());
    }

    #[test]
    fn receive_message_concatenates_data_chunks() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"0000005dhello");
        wire.extend_from_slice(b"0000005dworld");
        wire.extend_from_slice(b"0000000d");
        let mut session = harness(wire);
        let (exts, payload) = session.receive_message().expect("message to parse");
        assert!(exts.is_empty());
        assert_eq!(payload, b"helloworld");
    }

    #[test]
    fn receive_message_collects_extensions() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"0000009xtrace=1;");
        wire.extend_from_slice(b"0000000d");
        let mut session = harness(wire);
        let (exts, payload) = session.receive_message().expect("message to parse");
        assert_eq!(exts.get("trace"), Some(Some("1")));
        assert!(payload.is_empty());
    }

    #[test]
    fn send_writes_terminator() {
        let mut session = harness(Vec::new());
        session.send(&ExtensionMap::new(), b"hi").expect("send to succeed");
        assert!(session.transport.written.ends_with(b"0000000d"));
    }

    #[test]
    fn send_exit_emits_status_then_separate_terminator() {
        let mut session = harness(Vec::new());
        session.send_exit().expect("send_exit to succeed");
        let written = &session.transport.written;
        let exts_header = &written[..8];
        assert_eq!(&exts_header[7..8], b"x");
        assert!(written.ends_with(b"0000000d"));
    }

    #[test]
    fn broken_pipe_suppresses_exit_token() {
        let mut session = harness(Vec::new());
        session.mark_broken_pipe();
        session.send_exit().expect("send_exit to no-op");
        assert!(session.transport.written.is_empty());
    }
}
