//! Blocking frame transport: a socket plus the incremental parser.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use stomp_protocol::error::{ConnectionError, StompError};
use stomp_protocol::frame::{Frame, Transmission};
use stomp_protocol::parser::Parser;
use stomp_protocol::spec::Version;

const READ_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// SyncStream
// ---------------------------------------------------------------------------

/// A blocking byte stream the transport can drive.
///
/// This is the TCP/TLS seam: [`TcpStream`] implements it directly, and a
/// TLS wrapper implements it by delegating `poll_readable`/`shutdown` to the
/// underlying socket.
pub trait SyncStream: Read + Write {
    /// Block until the stream has bytes to read, the timeout elapses
    /// (`Ok(false)`), or the stream fails. `None` waits indefinitely.
    /// Interrupted system calls are retried with the remaining timeout.
    fn poll_readable(&mut self, timeout: Option<Duration>) -> std::io::Result<bool>;

    /// Tear the connection down.
    fn shutdown(&mut self) -> std::io::Result<()>;
}

impl SyncStream for TcpStream {
    fn poll_readable(&mut self, timeout: Option<Duration>) -> std::io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut probe = [0u8; 1];
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.set_read_timeout(remaining)?;
            let result = self.peek(&mut probe);
            self.set_read_timeout(None)?;
            match result {
                // A zero-byte peek means EOF; that counts as readable so the
                // next receive surfaces the close.
                Ok(_) => return Ok(true),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(false);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

// ---------------------------------------------------------------------------
// FrameTransport
// ---------------------------------------------------------------------------

/// Socket + parser: turns a byte stream into [`Transmission`]s and frames
/// into bytes.
#[derive(Debug)]
pub struct FrameTransport<S> {
    stream: S,
    parser: Parser,
    peer: String,
}

impl<S: SyncStream> FrameTransport<S> {
    pub fn new(stream: S, version: Version, peer: String) -> FrameTransport<S> {
        FrameTransport {
            stream,
            parser: Parser::new(version),
            peer,
        }
    }

    /// The broker address this transport is connected to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether a transmission can be taken without blocking longer than
    /// `timeout`. Checks the parser first, then polls the socket.
    pub fn can_read(&mut self, timeout: Option<Duration>) -> Result<bool, StompError> {
        if self.parser.can_read() {
            return Ok(true);
        }
        self.stream
            .poll_readable(timeout)
            .map_err(|e| ConnectionError::Io(e.to_string()).into())
    }

    /// Block until one transmission is parsed or the connection drops.
    pub fn receive(&mut self) -> Result<Transmission, StompError> {
        let mut buf = [0u8; READ_SIZE];
        loop {
            if let Some(transmission) = self.parser.get() {
                return Ok(transmission);
            }
            let n = self
                .stream
                .read(&mut buf)
                .map_err(|e| ConnectionError::Closed(e.to_string()))?;
            if n == 0 {
                return Err(ConnectionError::Closed("no more data".to_owned()).into());
            }
            self.parser.push(&buf[..n])?;
        }
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), StompError> {
        self.write(&frame.serialize()?)
    }

    pub fn send_transmission(&mut self, transmission: &Transmission) -> Result<(), StompError> {
        self.write(&transmission.serialize()?)
    }

    /// Switch the parser grammar after version negotiation.
    pub fn set_version(&mut self, version: Version) {
        self.parser.set_version(version);
    }

    pub fn shutdown(&mut self) -> Result<(), StompError> {
        self.stream
            .shutdown()
            .map_err(|e| ConnectionError::Io(e.to_string()).into())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StompError> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| ConnectionError::Io(e.to_string()).into())
    }
}
