//! Incremental wire-level parser.
//!
//! Feed it any chopping of the byte stream with [`Parser::push`]; complete
//! transmissions queue up for [`Parser::get`] in wire order. A single push
//! may complete zero, one or many transmissions.
//!
//! The parser is a three-state machine:
//! 1. `Idle` — between frames; a bare line delimiter here is a heart-beat
//!    (1.1+) or ignorable padding (1.0)
//! 2. `Head` — command line and header lines, validated eagerly as each
//!    line completes
//! 3. `Body` — `content-length` bytes when the header was given, otherwise
//!    everything up to the frame delimiter

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use crate::error::FrameError;
use crate::frame::{Frame, Headers, Transmission};
use crate::spec::{
    self, CARRIAGE_RETURN, Codec, FRAME_DELIMITER, HEADER_SEPARATOR, LINE_DELIMITER, Version,
};
use crate::escape;

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum State {
    Idle,
    Head(Head),
    Body { head: Head, length: Option<usize> },
}

#[derive(Debug, Default)]
struct Head {
    command: String,
    raw_headers: Headers,
}

/// Streaming byte-to-frame decoder, parameterized by protocol version.
#[derive(Debug)]
pub struct Parser {
    version: Version,
    buf: BytesMut,
    frames: VecDeque<Transmission>,
    state: State,
}

impl Parser {
    pub fn new(version: Version) -> Parser {
        Parser {
            version,
            buf: BytesMut::new(),
            frames: VecDeque::new(),
            state: State::Idle,
        }
    }

    /// Whether a parsed transmission is waiting to be taken.
    pub fn can_read(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Take the next parsed transmission, if any.
    pub fn get(&mut self) -> Option<Transmission> {
        self.frames.pop_front()
    }

    /// Add wire bytes and parse as far as they reach.
    ///
    /// On a malformed stream the buffered bytes are discarded and the error
    /// propagates; transmissions parsed before the bad frame remain
    /// available via [`Parser::get`].
    pub fn push(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buf.extend_from_slice(data);
        loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.buf.clear();
                    self.state = State::Idle;
                    return Err(e);
                }
            }
        }
    }

    /// Discard all buffered bytes and queued transmissions.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.frames.clear();
        self.state = State::Idle;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Switch the grammar to `version`.
    ///
    /// Only meaningful at a frame boundary; callers switch right after a
    /// CONNECTED frame so the negotiated grammar applies from the next frame
    /// on.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Run one transition. `Ok(true)` means progress was made and another
    /// step may follow; `Ok(false)` means more bytes are needed.
    fn step(&mut self) -> Result<bool, FrameError> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.step_idle(),
            State::Head(head) => self.step_head(head),
            State::Body { head, length } => self.step_body(head, length),
        }
    }

    fn step_idle(&mut self) -> Result<bool, FrameError> {
        let Some(&first) = self.buf.first() else {
            return Ok(false);
        };
        if first == LINE_DELIMITER {
            self.buf.advance(1);
            self.emit_heart_beat();
            return Ok(true);
        }
        if self.version == Version::V1_2 && first == CARRIAGE_RETURN {
            match self.buf.get(1) {
                Some(&LINE_DELIMITER) => {
                    self.buf.advance(2);
                    self.emit_heart_beat();
                    return Ok(true);
                }
                Some(_) => {} // not a line ending; falls through to Head
                None => {
                    self.state = State::Idle;
                    return Ok(false);
                }
            }
        }
        self.state = State::Head(Head::default());
        Ok(true)
    }

    fn step_head(&mut self, mut head: Head) -> Result<bool, FrameError> {
        let Some(line) = self.take_line()? else {
            self.state = State::Head(head);
            return Ok(false);
        };

        if head.command.is_empty() {
            if !spec::is_command(self.version, &line) {
                return Err(FrameError::InvalidCommand(line));
            }
            head.command = line;
            self.state = State::Head(head);
            return Ok(true);
        }

        if line.is_empty() {
            let length = head
                .raw_headers
                .iter()
                .find(|(name, _)| name == spec::header::CONTENT_LENGTH)
                .and_then(|(_, value)| value.parse::<usize>().ok());
            self.state = State::Body { head, length };
            return Ok(true);
        }

        let Some((name, value)) = line.split_once(HEADER_SEPARATOR) else {
            return Err(FrameError::HeaderSeparator(line));
        };
        let name = escape::unescape(self.version, &head.command, name)?.into_owned();
        let value = escape::unescape(self.version, &head.command, value)?.into_owned();
        head.raw_headers.push((name, value));
        self.state = State::Head(head);
        Ok(true)
    }

    fn step_body(&mut self, head: Head, length: Option<usize>) -> Result<bool, FrameError> {
        let body = match length {
            Some(length) => {
                if self.buf.len() < length + 1 {
                    self.state = State::Body { head, length: Some(length) };
                    return Ok(false);
                }
                let body = self.buf.split_to(length).to_vec();
                if self.buf[0] != FRAME_DELIMITER {
                    return Err(FrameError::MissingFrameDelimiter(length));
                }
                self.buf.advance(1);
                body
            }
            None => {
                let Some(end) = self.buf.iter().position(|&b| b == FRAME_DELIMITER) else {
                    self.state = State::Body { head, length: None };
                    return Ok(false);
                };
                let body = self.buf.split_to(end).to_vec();
                self.buf.advance(1);
                body
            }
        };

        if !body.is_empty() && !spec::body_allowed(self.version, &head.command) {
            return Err(FrameError::BodyNotAllowed(head.command));
        }

        let mut frame = Frame::with_raw_headers(head.command, head.raw_headers, body);
        frame.version = self.version;
        self.frames.push_back(Transmission::Frame(frame));
        self.state = State::Idle;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn emit_heart_beat(&mut self) {
        // 1.0 has no heart-beats; a stray newline between frames is padding.
        if self.version != Version::V1_0 {
            self.frames.push_back(Transmission::HeartBeat);
        }
    }

    /// Take one complete head line off the buffer, decoded per the version's
    /// codec, with a 1.2 trailing carriage return stripped.
    fn take_line(&mut self) -> Result<Option<String>, FrameError> {
        let Some(end) = self.buf.iter().position(|&b| b == LINE_DELIMITER) else {
            return Ok(None);
        };
        let mut raw = self.buf.split_to(end);
        self.buf.advance(1);
        if spec::strip_line_delimiter(self.version) == Some('\r')
            && raw.last() == Some(&CARRIAGE_RETURN)
        {
            raw.truncate(raw.len() - 1);
        }
        let line = match spec::codec(self.version) {
            Codec::Ascii if !raw.is_ascii() => return Err(FrameError::Decoding(self.version)),
            _ => String::from_utf8(raw.to_vec())
                .map_err(|_| FrameError::Decoding(self.version))?,
        };
        Ok(Some(line))
    }
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new(Version::default())
    }
}
