//! Error taxonomy shared by every crate in the workspace.
//!
//! The kinds map one-to-one onto failure domains: `FrameError` for malformed
//! wire bytes, `ProtocolError` for well-formed frames with broken semantics
//! (or API misuse), `ConnectionError` for the transport layer, `Cancelled`
//! for in-flight operations torn down with a reason, and `AlreadyRunning`
//! for a second concurrent connect/disconnect attempt.
//!
//! All variants carry owned strings instead of source errors so that they
//! stay `Clone`: the async client broadcasts the disconnect reason to every
//! waiter.

use crate::spec::Version;

// ---------------------------------------------------------------------------
// FrameError
// ---------------------------------------------------------------------------

/// Malformed wire-level bytes. The parser discards its buffer when raising
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),
    #[error("no separator in header line: {0:?}")]
    HeaderSeparator(String),
    #[error("no escape sequence defined for this character: {0:?}")]
    Escape(char),
    #[error("no body allowed for this command: {0}")]
    BodyNotAllowed(String),
    #[error("cannot encode header as {codec} (version {version}): {text:?}")]
    Encoding {
        version: Version,
        codec: &'static str,
        text: String,
    },
    #[error("cannot decode header line (version {0}): invalid byte sequence")]
    Decoding(Version),
    #[error("missing frame delimiter after {0}-byte body")]
    MissingFrameDelimiter(usize),
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// A well-formed frame (or API call) that violates STOMP semantics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid {command} frame ({header} header mandatory{})", version_suffix(.version))]
    MissingHeader {
        command: String,
        header: &'static str,
        version: Option<Version>,
    },
    #[error("unexpected {got} frame (expected {expected})")]
    UnexpectedCommand { got: String, expected: &'static str },
    #[error("unsupported command (version {version}): {command}")]
    UnsupportedCommand {
        command: &'static str,
        version: Version,
    },
    #[error("version is not supported: {0:?}")]
    UnsupportedVersion(String),
    #[error("server version {got:?} incompatible with accepted versions {offered:?}")]
    IncompatibleVersion { got: String, offered: Vec<Version> },
    #[error("heart-beating not supported (version {0})")]
    HeartBeatsUnsupported(Version),
    #[error("invalid heart-beat header (two comma-separated non-negative integers required): {0:?}")]
    InvalidHeartBeat(String),
    #[error("host header required when offering versions beyond 1.0")]
    MissingHost,
    #[error("{operation} not allowed in session state {state}")]
    WrongState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("duplicate subscription: {0}")]
    DuplicateSubscription(String),
    #[error("unexpected receipt: {0}")]
    UnknownReceipt(String),
    #[error("duplicate pending receipt: {0}")]
    DuplicateReceipt(String),
    #[error("transaction is not active: {0}")]
    UnknownTransaction(String),
    #[error("transaction already active: {0}")]
    DuplicateTransaction(String),
    #[error("broker error: {0}")]
    BrokerError(String),
}

fn version_suffix(version: &Option<Version>) -> String {
    match version {
        Some(version) => format!(" in version {version}"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// ConnectionError
// ---------------------------------------------------------------------------

/// Transport-layer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect to {broker} [{detail}]")]
    Connect { broker: String, detail: String },
    #[error("connection closed [{0}]")]
    Closed(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("i/o failure [{0}]")]
    Io(String),
    #[error("maximum retries reached")]
    RetriesExhausted,
    #[error("server heart-beat timeout")]
    HeartBeatTimeout,
    #[error("invalid broker uri: {0}")]
    Uri(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// StompError
// ---------------------------------------------------------------------------

/// The umbrella error every public fallible API returns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StompError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("already running: {0}")]
    AlreadyRunning(&'static str),
}

impl StompError {
    /// Whether this error cancels an in-flight operation (as opposed to
    /// failing it outright).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StompError::Cancelled(_))
    }
}

impl From<std::io::Error> for StompError {
    fn from(e: std::io::Error) -> Self {
        StompError::Connection(ConnectionError::from(e))
    }
}
