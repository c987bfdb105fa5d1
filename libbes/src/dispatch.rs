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

//! The seam between the per-session worker loop and the external
//! request-dispatch pipeline (module loader, request handlers, data format
//! translators). The pipeline itself is a named external collaborator and
//! is not implemented here; this module defines the trait it must satisfy
//! and the adapter the worker loop uses to re-chunk its output.

use std::io::{self, Write};

use ppt_protocol::ExtensionMap;

/// What the external dispatch reported after handling one request.
pub enum DispatchOutcome {
    /// Handled normally; the stream buffer's contents become the response
    /// payload.
    Success,
    /// A fatal dispatch error; the session must emit the error text, signal
    /// exit, and terminate. See spec §4.5e / §7 `DispatchTerminateImmediate`.
    TerminateImmediate { message: String },
    /// A recoverable user syntax error; the session continues after
    /// reporting it. See spec §4.5f / §7 `DispatchUserSyntax`.
    UserSyntax { message: String },
}

/// Implemented by the (out of scope) request-dispatch pipeline. The worker
/// loop calls `handle` once per received message and re-chunks whatever is
/// written to `out` into framed data chunks.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &[u8], extensions: &ExtensionMap, out: &mut dyn Write) -> DispatchOutcome;
}

/// A `RequestHandler` that always fails; wired in by the worker binaries
/// until a real dispatch pipeline is plugged in. Exercises the
/// `DispatchTerminateImmediate` path so the surrounding session logic has a
/// concrete failure mode to test against.
pub struct UnimplementedDispatch;

impl RequestHandler for UnimplementedDispatch {
    fn handle(&self, _request: &[u8], _extensions: &ExtensionMap, _out: &mut dyn Write) -> DispatchOutcome {
        DispatchOutcome::TerminateImmediate {
            message: "no request-dispatch pipeline is configured".to_string(),
        }
    }
}

/// An adapter sink that buffers dispatch output in memory. Replaces the
/// original's `PPTStreamBuf` (a `std::streambuf` subclass that captured
/// `cout` writes); here the dispatch is simply handed a `Write` target, so
/// there is no need for global stdout redirection.
#[derive(Default)]
pub struct ResponseBuffer {
    buf: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        ResponseBuffer::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for ResponseBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unimplemented_dispatch_terminates() {
        let handler = UnimplementedDispatch;
        let mut out = ResponseBuffer::new();
        match handler.handle(b"req", &ExtensionMap::new(), &mut out) {
            DispatchOutcome::TerminateImmediate { message } => assert!(!message.is_empty()),
            _ => panic!("expected TerminateImmediate"),
        }
    }

    #[test]
    fn response_buffer_collects_writes() {
        let mut buf = ResponseBuffer::new();
        buf.write_all(b"hello").unwrap();
        buf.write_all(b" world").unwrap();
        assert_eq!(buf.into_inner(), b"hello world");
    }
}
