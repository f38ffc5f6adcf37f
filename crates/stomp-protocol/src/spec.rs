//! Per-version STOMP protocol tables.
//!
//! Single source of truth for everything that varies between wire versions
//! 1.0, 1.1 and 1.2: command sets, body rules, header codecs, line-ending
//! tolerance and the header escape tables.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// A STOMP wire protocol version.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    #[default]
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    pub const ALL: [Version; 3] = [Version::V1_0, Version::V1_1, Version::V1_2];

    pub fn as_str(self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    /// All versions prior or equal to `self`, ascending.
    pub fn upto(self) -> impl Iterator<Item = Version> {
        Version::ALL.into_iter().filter(move |v| *v <= self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            "1.2" => Ok(Version::V1_2),
            other => Err(ProtocolError::UnsupportedVersion(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub mod command {
    pub const ABORT: &str = "ABORT";
    pub const ACK: &str = "ACK";
    pub const BEGIN: &str = "BEGIN";
    pub const COMMIT: &str = "COMMIT";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";
    pub const NACK: &str = "NACK";
    pub const SEND: &str = "SEND";
    pub const STOMP: &str = "STOMP";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";

    pub const CONNECTED: &str = "CONNECTED";
    pub const ERROR: &str = "ERROR";
    pub const MESSAGE: &str = "MESSAGE";
    pub const RECEIPT: &str = "RECEIPT";
}

const CLIENT_COMMANDS_1_0: &[&str] = &[
    command::ABORT,
    command::ACK,
    command::BEGIN,
    command::COMMIT,
    command::CONNECT,
    command::DISCONNECT,
    command::SEND,
    command::SUBSCRIBE,
    command::UNSUBSCRIBE,
];

const CLIENT_COMMANDS_1_1: &[&str] = &[
    command::ABORT,
    command::ACK,
    command::BEGIN,
    command::COMMIT,
    command::CONNECT,
    command::DISCONNECT,
    command::NACK,
    command::SEND,
    command::STOMP,
    command::SUBSCRIBE,
    command::UNSUBSCRIBE,
];

const SERVER_COMMANDS: &[&str] = &[
    command::CONNECTED,
    command::ERROR,
    command::MESSAGE,
    command::RECEIPT,
];

pub fn client_commands(version: Version) -> &'static [&'static str] {
    match version {
        Version::V1_0 => CLIENT_COMMANDS_1_0,
        Version::V1_1 | Version::V1_2 => CLIENT_COMMANDS_1_1,
    }
}

pub fn server_commands(_version: Version) -> &'static [&'static str] {
    SERVER_COMMANDS
}

/// Whether `command` is a known client or server command under `version`.
pub fn is_command(version: Version, command: &str) -> bool {
    client_commands(version).contains(&command) || SERVER_COMMANDS.contains(&command)
}

/// Whether frames with `command` may carry a body under `version`.
///
/// STOMP 1.0 places no restriction; 1.1 and 1.2 restrict bodies to SEND,
/// MESSAGE and ERROR.
pub fn body_allowed(version: Version, command: &str) -> bool {
    match version {
        Version::V1_0 => true,
        Version::V1_1 | Version::V1_2 => {
            matches!(command, command::SEND | command::MESSAGE | command::ERROR)
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SESSION: &str = "session";
    pub const SERVER: &str = "server";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
}

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

pub const LINE_DELIMITER: u8 = b'\n';
pub const CARRIAGE_RETURN: u8 = b'\r';
pub const FRAME_DELIMITER: u8 = 0;
pub const HEADER_SEPARATOR: char = ':';
pub const ESCAPE_CHARACTER: char = '\\';
pub const HEART_BEAT_SEPARATOR: char = ',';

/// The trailing character stripped from every head line, if the version
/// tolerates carriage-return line endings.
pub fn strip_line_delimiter(version: Version) -> Option<char> {
    match version {
        Version::V1_2 => Some('\r'),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Header codec
// ---------------------------------------------------------------------------

/// The text codec used for commands and headers. Bodies are opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Ascii,
    Utf8,
}

pub fn codec(version: Version) -> Codec {
    match version {
        Version::V1_0 => Codec::Ascii,
        Version::V1_1 | Version::V1_2 => Codec::Utf8,
    }
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Pairs of (raw character, escape letter): the raw character is written as
/// `\` + letter on the wire.
pub fn escaped_characters(version: Version) -> &'static [(char, char)] {
    match version {
        Version::V1_0 => &[],
        Version::V1_1 => &[('\r', 'r'), ('\n', 'n'), (':', 'c'), ('\\', '\\')],
        Version::V1_2 => &[
            ('\r', 'r'),
            ('\n', 'n'),
            (':', 'c'),
            ('\\', '\\'),
            ('\t', 't'),
        ],
    }
}

/// CONNECT and CONNECTED never participate in header escaping, in any
/// version.
pub fn escape_excluded(command: &str) -> bool {
    matches!(command, command::CONNECT | command::CONNECTED)
}

// ---------------------------------------------------------------------------
// Ack modes
// ---------------------------------------------------------------------------

pub const ACK_AUTO: &str = "auto";
pub const ACK_CLIENT: &str = "client";
pub const ACK_CLIENT_INDIVIDUAL: &str = "client-individual";

/// Whether `mode` requires client-side acknowledgement.
pub fn is_client_ack(mode: &str) -> bool {
    matches!(mode, ACK_CLIENT | ACK_CLIENT_INDIVIDUAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_and_upto() {
        assert!(Version::V1_0 < Version::V1_1);
        assert!(Version::V1_1 < Version::V1_2);
        let upto: Vec<_> = Version::V1_1.upto().collect();
        assert_eq!(upto, vec![Version::V1_0, Version::V1_1]);
    }

    #[test]
    fn version_round_trips_through_display() {
        for version in Version::ALL {
            assert_eq!(version.as_str().parse::<Version>().unwrap(), version);
        }
        assert!("2.0".parse::<Version>().is_err());
    }

    #[test]
    fn nack_and_stomp_are_1_1_commands() {
        assert!(!is_command(Version::V1_0, command::NACK));
        assert!(!is_command(Version::V1_0, command::STOMP));
        assert!(is_command(Version::V1_1, command::NACK));
        assert!(is_command(Version::V1_2, command::STOMP));
    }

    #[test]
    fn body_rules_differ_between_1_0_and_1_1() {
        assert!(body_allowed(Version::V1_0, command::RECEIPT));
        assert!(!body_allowed(Version::V1_1, command::RECEIPT));
        assert!(body_allowed(Version::V1_1, command::SEND));
        assert!(body_allowed(Version::V1_2, command::ERROR));
    }

    #[test]
    fn escape_tables_grow_with_the_version() {
        assert!(escaped_characters(Version::V1_0).is_empty());
        assert!(!escaped_characters(Version::V1_1).contains(&('\t', 't')));
        assert!(escaped_characters(Version::V1_2).contains(&('\t', 't')));
    }
}
