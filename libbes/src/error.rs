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

//! The error taxonomy shared by the session, worker and admin layers.
//!
//! Codec- and socket-level errors are defined in `ppt_protocol`; this module
//! adds the layers above that need to dispatch on error *kind* rather than
//! just propagate and log.

use std::fmt;

use ppt_protocol::PptError;

#[derive(Debug)]
pub enum BesError {
    /// A frame-level error from the wire codec.
    Ppt(PptError),
    /// The client never completed the handshake within the session timeout.
    HandshakeTimeout,
    /// The peer responded to the handshake probe with something other than
    /// `PPTSERVER_CONNECTION_OK` or `PPTSERVER_AUTHENTICATE`.
    HandshakeRejected { reason: String },
    /// The external dispatch failed in a way that terminates the session.
    DispatchTerminateImmediate { message: String },
    /// The external dispatch reported a user syntax error; the session
    /// continues.
    DispatchUserSyntax { message: String },
    /// Any error serious enough to abort the session, or in the supervisor,
    /// escalate via process exit.
    InternalFatal { message: String },
    /// The admin handler received an unrecognized command element.
    SyntaxUser { message: String },
}

impl fmt::Display for BesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BesError::Ppt(e) => write!(f, "{e}"),
            BesError::HandshakeTimeout => write!(f, "handshake timed out waiting for peer"),
            BesError::HandshakeRejected { reason } => {
                write!(f, "handshake rejected by peer: {reason}")
            }
            BesError::DispatchTerminateImmediate { message } => {
                write!(f, "dispatch failed fatally: {message}")
            }
            BesError::DispatchUserSyntax { message } => write!(f, "dispatch syntax error: {message}"),
            BesError::InternalFatal { message } => write!(f, "internal error: {message}"),
            BesError::SyntaxUser { message } => write!(f, "syntax error: {message}"),
        }
    }
}

impl std::error::Error for BesError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BesError::Ppt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PptError> for BesError {
    fn from(e: PptError) -> Self {
        BesError::Ppt(e)
    }
}

impl BesError {
    /// Whether this error should close just the current session (`true`) as
    /// opposed to being escalated further up the process hierarchy.
    pub fn is_session_local(&self) -> bool {
        !matches!(self, BesError::InternalFatal { .. })
    }
}
