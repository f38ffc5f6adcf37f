//! STOMP frame and heart-beat value objects.
//!
//! A frame keeps the headers exactly as they appeared on the wire
//! (`raw_headers`, duplicates and order preserved) alongside a deduplicated
//! first-occurrence view, which is the one header lookups go through. Frames
//! built programmatically carry only the deduplicated form.

use std::fmt;

use crate::error::FrameError;
use crate::escape;
use crate::spec::{self, Codec, FRAME_DELIMITER, HEADER_SEPARATOR, LINE_DELIMITER, Version};

/// Header sequence: ordered (name, value) pairs.
pub type Headers = Vec<(String, String)>;

/// Bytes of a body shown by [`Frame::info`] before truncation.
const INFO_LENGTH: usize = 20;

/// Headers a broker stamps onto MESSAGE frames; stripped before a frame is
/// forwarded to an error destination.
const RESERVED_HEADERS: &[&str] = &[
    spec::header::MESSAGE_ID,
    spec::header::DESTINATION,
    "timestamp",
    "expires",
    "priority",
];

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One STOMP frame: command, headers, opaque body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: String,
    headers: Headers,
    raw_headers: Option<Headers>,
    pub body: Vec<u8>,
    pub version: Version,
}

impl Frame {
    /// A frame with deduplicated headers (programmatic construction).
    pub fn new(command: impl Into<String>, headers: Headers, body: Vec<u8>) -> Frame {
        Frame {
            command: command.into(),
            headers,
            raw_headers: None,
            body,
            version: Version::default(),
        }
    }

    /// A frame carrying headers in wire order, duplicates preserved
    /// (parser construction).
    pub fn with_raw_headers(
        command: impl Into<String>,
        raw_headers: Headers,
        body: Vec<u8>,
    ) -> Frame {
        Frame {
            command: command.into(),
            headers: Headers::new(),
            raw_headers: Some(raw_headers),
            body,
            version: Version::default(),
        }
    }

    /// The first occurrence of `name`, in wire order.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.active_headers()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Deduplicated header view: for each name, the first occurrence in wire
    /// order.
    pub fn headers(&self) -> Vec<(&str, &str)> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for (name, value) in self.active_headers() {
            if seen.contains(&name.as_str()) {
                continue;
            }
            seen.push(name);
            out.push((name.as_str(), value.as_str()));
        }
        out
    }

    /// The wire-order header sequence, if this frame was parsed off a
    /// socket.
    pub fn raw_headers(&self) -> Option<&Headers> {
        self.raw_headers.as_ref()
    }

    /// Replace the first occurrence of `name` (or append it).
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let storage = match self.raw_headers.as_mut() {
            Some(raw) => raw,
            None => &mut self.headers,
        };
        match storage.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.into(),
            None => storage.push((name.to_owned(), value.into())),
        }
    }

    /// Append `name` unless some occurrence already exists.
    pub fn set_header_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if self.header(name).is_none() {
            self.set_header(name, value);
        }
    }

    /// Collapse the wire-order headers into the deduplicated view
    /// (first occurrence wins) and drop the raw sequence.
    pub fn unraw(&mut self) {
        if self.raw_headers.is_some() {
            self.headers = self
                .headers()
                .into_iter()
                .map(|(n, v)| (n.to_owned(), v.to_owned()))
                .collect();
            self.raw_headers = None;
        }
    }

    /// Serialize to wire bytes: `<command>\n<headers>\n<body>\0`.
    ///
    /// Raw headers are emitted verbatim in wire order when present,
    /// otherwise the deduplicated view in insertion order. Names and values
    /// are escaped per the frame's version (CONNECT/CONNECTED exempt) and
    /// must fit the version's codec.
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.command.len() + self.body.len() + 64);
        self.encode(&mut out, &self.command)?;
        out.push(LINE_DELIMITER);
        for (name, value) in self.active_headers() {
            self.encode(&mut out, &escape::escape(self.version, &self.command, name))?;
            out.push(HEADER_SEPARATOR as u8);
            self.encode(&mut out, &escape::escape(self.version, &self.command, value))?;
            out.push(LINE_DELIMITER);
        }
        out.push(LINE_DELIMITER);
        out.extend_from_slice(&self.body);
        out.push(FRAME_DELIMITER);
        Ok(out)
    }

    /// Log-friendly one-liner; the body is truncated to 20 bytes.
    pub fn info(&self) -> String {
        let mut parts = Vec::new();
        let headers = self.headers();
        if !headers.is_empty() {
            parts.push(format!("headers={headers:?}"));
        }
        if !self.body.is_empty() {
            let shown = &self.body[..self.body.len().min(INFO_LENGTH)];
            let suffix = if self.body.len() > INFO_LENGTH { "..." } else { "" };
            parts.push(format!(
                "body={:?}{suffix}",
                String::from_utf8_lossy(shown)
            ));
        }
        if parts.is_empty() {
            format!("{} frame", self.command)
        } else {
            format!("{} frame [{}]", self.command, parts.join(", "))
        }
    }

    /// A copy suitable for forwarding to an error destination: the
    /// broker-reserved headers are stripped so the broker will stamp fresh
    /// ones.
    pub fn forward_copy(&self) -> Frame {
        let headers = self
            .headers()
            .into_iter()
            .filter(|(name, _)| !RESERVED_HEADERS.contains(name))
            .map(|(n, v)| (n.to_owned(), v.to_owned()))
            .collect();
        let mut copy = Frame::new(self.command.clone(), headers, self.body.clone());
        copy.version = self.version;
        copy
    }

    fn active_headers(&self) -> &Headers {
        self.raw_headers.as_ref().unwrap_or(&self.headers)
    }

    fn encode(&self, out: &mut Vec<u8>, text: &str) -> Result<(), FrameError> {
        if spec::codec(self.version) == Codec::Ascii && !text.is_ascii() {
            return Err(FrameError::Encoding {
                version: self.version,
                codec: "ascii",
                text: text.to_owned(),
            });
        }
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

/// Structural equality on command, deduplicated header view and body.
/// Version and raw header order are excluded, so a parsed frame compares
/// equal to the frame that produced its bytes.
impl PartialEq for Frame {
    fn eq(&self, other: &Frame) -> bool {
        if self.command != other.command || self.body != other.body {
            return false;
        }
        let mut mine = self.headers();
        let mut theirs = other.headers();
        mine.sort_unstable();
        theirs.sort_unstable();
        mine == theirs
    }
}

impl Eq for Frame {}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}

// ---------------------------------------------------------------------------
// Transmission
// ---------------------------------------------------------------------------

/// One unit on the wire: a full frame or a bare heart-beat.
///
/// A heart-beat serializes to a single line delimiter and never compares
/// equal to any frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmission {
    Frame(Frame),
    HeartBeat,
}

impl Transmission {
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Transmission::Frame(frame) => frame.serialize(),
            Transmission::HeartBeat => Ok(vec![LINE_DELIMITER]),
        }
    }

    pub fn info(&self) -> String {
        match self {
            Transmission::Frame(frame) => frame.info(),
            Transmission::HeartBeat => "heart-beat".to_owned(),
        }
    }

    /// The frame, if this is one.
    pub fn frame(self) -> Option<Frame> {
        match self {
            Transmission::Frame(frame) => Some(frame),
            Transmission::HeartBeat => None,
        }
    }
}
