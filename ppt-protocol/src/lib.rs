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

//! Wire-level framing for PPT (Point-to-Point Transport), the chunked
//! protocol bes uses between clients, the master worker, and the
//! supervisor's admin channel.
//!
//! A chunk header is 8 ASCII bytes: 7 lowercase hex digits giving the
//! byte length of the body, followed by a single tag byte, `x` for
//! extensions or `d` for data. A length-0 `d` chunk is the terminator
//! that ends a logical message.

use std::{fmt, io};

pub mod handshake {
    /// Sent raw (un-framed) by the client to open a session.
    pub const CLIENT_TESTING_CONNECTION: &str = "PPTCLIENT_TESTING_CONNECTION";
    /// Sent raw by a non-TLS server in reply to a successful probe.
    pub const SERVER_CONNECTION_OK: &str = "PPTSERVER_CONNECTION_OK";
    /// Sent raw by a TLS-enabled server instead of CONNECTION_OK.
    pub const SERVER_AUTHENTICATE: &str = "PPTSERVER_AUTHENTICATE";
}

/// The extension key used to signal an orderly end-of-session.
pub const STATUS_KEY: &str = "status";
/// The extension value paired with [`STATUS_KEY`] to request a clean exit.
pub const EXIT_NOW: &str = "exit_now";
/// Paired with [`STATUS_KEY`] to flag that the response carries an error.
pub const ERROR_STATUS: &str = "error";
/// Set alongside an error status to indicate the session cannot continue.
pub const EXIT_KEY: &str = "exit";

/// Width, in hex digits, of the chunk length field.
pub const LENGTH_DIGITS: usize = 7;
/// Total size of a chunk header: 7 hex digits plus one tag byte.
pub const HEADER_LEN: usize = LENGTH_DIGITS + 1;
/// The largest body a single chunk may carry (0x0FFFFFF bytes).
pub const MAX_CHUNK_LEN: usize = 0x0FFF_FFF;
/// Bytes reserved by the codec when a socket reports its buffer size, so
/// a single read never needs to split a chunk header across two reads.
pub const HEADER_RESERVE: usize = 15;

/// The error taxonomy for the framing codec (spec-wide error kinds that
/// originate below the session layer live here; session/worker/admin
/// errors build on top of these in `libbes`).
#[derive(Debug)]
pub enum PptError {
    /// The peer sent bytes that do not parse as a well-formed chunk.
    MalformedFrame(String),
    /// The peer closed the connection cleanly before any header byte
    /// arrived; distinguished from `MalformedFrame` because an orderly
    /// EOF at a message boundary is not an error.
    PeerClosed,
    /// Propagated I/O failure from the underlying socket.
    Io(io::Error),
}

impl fmt::Display for PptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PptError::MalformedFrame(msg) => write!(f, "malformed PPT frame: {msg}"),
            PptError::PeerClosed => write!(f, "peer closed the connection"),
            PptError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PptError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PptError {
    fn from(e: io::Error) -> Self {
        PptError::Io(e)
    }
}

/// What kind of body follows a chunk header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// The body is opaque payload bytes.
    Data,
    /// The body is a semicolon-terminated extension list.
    Extensions,
}

impl ChunkKind {
    fn tag(self) -> u8 {
        match self {
            ChunkKind::Data => b'd',
            ChunkKind::Extensions => b'x',
        }
    }

    fn from_tag(tag: u8) -> Result<Self, PptError> {
        match tag {
            b'd' => Ok(ChunkKind::Data),
            b'x' => Ok(ChunkKind::Extensions),
            other => Err(PptError::MalformedFrame(format!(
                "unexpected chunk tag byte {:?}",
                other as char
            ))),
        }
    }
}

/// A decoded chunk header: the body length and what kind of body follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub length: usize,
    pub kind: ChunkKind,
}

impl ChunkHeader {
    /// The zero-length data chunk that ends a logical message.
    pub fn terminator() -> Self {
        ChunkHeader { length: 0, kind: ChunkKind::Data }
    }

    pub fn is_terminator(&self) -> bool {
        self.length == 0 && self.kind == ChunkKind::Data
    }
}

/// Render an 8-byte chunk header: 7 lowercase hex digits then the tag.
pub fn encode_header(length: usize, kind: ChunkKind) -> Result<[u8; HEADER_LEN], PptError> {
    if length > MAX_CHUNK_LEN {
        return Err(PptError::MalformedFrame(format!(
            "chunk body of {length} bytes exceeds the {MAX_CHUNK_LEN} byte cap"
        )));
    }
    let hex = format!("{length:07x}");
    let mut buf = [0u8; HEADER_LEN];
    buf[..LENGTH_DIGITS].copy_from_slice(hex.as_bytes());
    buf[LENGTH_DIGITS] = kind.tag();
    Ok(buf)
}

/// Parse an already-read 8-byte header.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<ChunkHeader, PptError> {
    let len_str = std::str::from_utf8(&buf[..LENGTH_DIGITS])
        .map_err(|_| PptError::MalformedFrame("chunk length is not ASCII".into()))?;
    let length = usize::from_str_radix(len_str, 16)
        .map_err(|_| PptError::MalformedFrame(format!("invalid hex chunk length {len_str:?}")))?;
    let kind = ChunkKind::from_tag(buf[LENGTH_DIGITS])?;
    Ok(ChunkHeader { length, kind })
}

/// Read exactly one 8-byte chunk header from `r`.
///
/// A clean EOF before any header byte is read surfaces as
/// [`PptError::PeerClosed`]; any other short read is `MalformedFrame`.
pub fn read_header<R: io::Read>(r: &mut R) -> Result<ChunkHeader, PptError> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Err(PptError::PeerClosed);
                }
                return Err(PptError::MalformedFrame("EOF inside chunk header".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    decode_header(&buf)
}

/// Write a chunk header to `w`.
pub fn write_header<W: io::Write>(w: &mut W, length: usize, kind: ChunkKind) -> Result<(), PptError> {
    let header = encode_header(length, kind)?;
    w.write_all(&header)?;
    Ok(())
}

/// Read exactly `len` bytes of a chunk body into `buf`, looping on short
/// reads. `buf` must be at least `len` bytes.
pub fn read_body_exact<R: io::Read>(r: &mut R, buf: &mut [u8], len: usize) -> Result<(), PptError> {
    let mut filled = 0;
    while filled < len {
        match r.read(&mut buf[filled..len]) {
            Ok(0) => {
                return Err(PptError::MalformedFrame(format!(
                    "EOF after {filled} of {len} expected body bytes"
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// An ordered name -> optional-value extension list. Duplicate names are
/// legal on the wire; the last occurrence wins once decoded into this map,
/// per the receiver contract.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionMap {
    entries: Vec<(String, Option<String>)>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        ExtensionMap { entries: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert or overwrite `name`, preserving the first-seen position but
    /// the newest value, matching "the receiver must accept the last
    /// occurrence" from the wire grammar.
    pub fn insert<N: Into<String>>(&mut self, name: N, value: Option<String>) {
        let name = name.into();
        if let Some(existing) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn exit_now() -> Self {
        let mut m = ExtensionMap::new();
        m.insert(STATUS_KEY, Some(EXIT_NOW.to_string()));
        m
    }

    pub fn is_exit_now(&self) -> bool {
        self.get(STATUS_KEY) == Some(Some(EXIT_NOW))
    }
}

/// Serialize to the wire form `*( name [ "=" value ] ";" )`.
pub fn format_extensions(exts: &ExtensionMap) -> String {
    let mut out = String::new();
    for (name, value) in exts.iter() {
        out.push_str(name);
        if let Some(v) = value {
            if !v.is_empty() {
                out.push('=');
                out.push_str(v);
            }
        }
        out.push(';');
    }
    out
}

/// Parse the wire form back into an [`ExtensionMap`].
pub fn parse_extensions(body: &str) -> Result<ExtensionMap, PptError> {
    let mut map = ExtensionMap::new();
    let mut rest = body;
    while !rest.is_empty() {
        let semi = rest.find(';').ok_or_else(|| {
            PptError::MalformedFrame(format!("extension segment {rest:?} missing trailing ';'"))
        })?;
        let segment = &rest[..semi];
        match segment.find('=') {
            None => {
                if segment.is_empty() {
                    return Err(PptError::MalformedFrame("empty extension name".into()));
                }
                map.insert(segment.to_string(), None);
            }
            Some(eq) => {
                let name = &segment[..eq];
                let value = &segment[eq + 1..];
                if name.is_empty() {
                    return Err(PptError::MalformedFrame("empty extension name".into()));
                }
                if value.is_empty() {
                    return Err(PptError::MalformedFrame(format!(
                        "extension {name:?} has a trailing '=' with no value"
                    )));
                }
                map.insert(name.to_string(), Some(value.to_string()));
            }
        }
        rest = &rest[semi + 1..];
    }
    Ok(map)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let cases = vec![
            (0usize, ChunkKind::Data),
            (5, ChunkKind::Data),
            (MAX_CHUNK_LEN, ChunkKind::Data),
            (9, ChunkKind::Extensions),
        ];
        for (len, kind) in cases {
            let encoded = encode_header(len, kind).expect("encode to succeed");
            assert_eq!(encoded.len(), HEADER_LEN);
            let decoded = decode_header(&encoded).expect("decode to succeed");
            assert_eq!(decoded, ChunkHeader { length: len, kind });
        }
    }

    #[test]
    fn terminator_header_is_exact_ascii() {
        let encoded = encode_header(0, ChunkKind::Data).unwrap();
        assert_eq!(&encoded, b"0000000d");
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let err = encode_header(MAX_CHUNK_LEN + 1, ChunkKind::Data).unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn read_header_peer_closed_on_clean_eof() {
        let mut empty: &[u8] = &[];
        let err = read_header(&mut empty).unwrap_err();
        assert!(matches!(err, PptError::PeerClosed));
    }

    #[test]
    fn read_header_malformed_on_short_eof() {
        let mut short: &[u8] = b"0000";
        let err = read_header(&mut short).unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn read_header_rejects_bad_tag() {
        let mut buf: &[u8] = b"0000005z";
        let err = read_header(&mut buf).unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn extensions_round_trip() {
        let mut map = ExtensionMap::new();
        map.insert("trace", Some("1".to_string()));
        map.insert("lonely", None);
        let wire = format_extensions(&map);
        let parsed = parse_extensions(&wire).expect("parse to succeed");
        assert_eq!(parsed, map);
    }

    #[test]
    fn single_key_no_value_parses_to_none() {
        let parsed = parse_extensions("name;").expect("parse to succeed");
        assert_eq!(parsed.get("name"), Some(None));
    }

    #[test]
    fn duplicate_name_keeps_last_occurrence() {
        let parsed = parse_extensions("status=one;status=two;").expect("parse to succeed");
        assert_eq!(parsed.get("status"), Some(Some("two")));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn missing_trailing_semicolon_is_malformed() {
        let err = parse_extensions("name=value").unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn empty_name_is_malformed() {
        let err = parse_extensions("=value;").unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn trailing_equals_with_no_value_is_malformed() {
        let err = parse_extensions("name=;").unwrap_err();
        assert!(matches!(err, PptError::MalformedFrame(_)));
    }

    #[test]
    fn exit_now_round_trips() {
        let exts = ExtensionMap::exit_now();
        assert!(exts.is_exit_now());
        let wire = format_extensions(&exts);
        assert_eq!(wire, "status=exit_now;");
    }
}
