//! Stateless constructors and validators for every STOMP verb.
//!
//! Outgoing commands build [`Frame`]s; incoming validators check mandatory
//! headers and hand back the piece of information the caller needs (the
//! negotiated version, a subscription token, a receipt id). Version-gated
//! features (NACK, STOMP, heart-beats) are rejected under 1.0.
//!
//! Everything here is pure; the [`Session`](crate::session::Session) drives
//! these functions and owns the state.

use std::collections::HashSet;

use crate::error::ProtocolError;
use crate::frame::{Frame, Headers, Transmission};
use crate::spec::{HEART_BEAT_SEPARATOR, Version, command, header};

// ---------------------------------------------------------------------------
// Subscription token
// ---------------------------------------------------------------------------

/// The handle identifying one subscription.
///
/// 1.1+ identifies subscriptions by their mandatory `id` header; 1.0 falls
/// back to the destination when no `id` was given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    pub kind: TokenKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Id,
    Destination,
}

impl SubscriptionToken {
    pub fn id(value: impl Into<String>) -> SubscriptionToken {
        SubscriptionToken {
            kind: TokenKind::Id,
            value: value.into(),
        }
    }

    pub fn destination(value: impl Into<String>) -> SubscriptionToken {
        SubscriptionToken {
            kind: TokenKind::Destination,
            value: value.into(),
        }
    }

    fn header_name(&self) -> &'static str {
        match self.kind {
            TokenKind::Id => header::ID,
            TokenKind::Destination => header::DESTINATION,
        }
    }
}

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.header_name(), self.value)
    }
}

// ---------------------------------------------------------------------------
// Outgoing commands
// ---------------------------------------------------------------------------

/// Build a CONNECT frame.
///
/// Offering any version beyond 1.0 adds `accept-version` (comma-joined
/// ascending) and the mandatory `host` header; `heart_beats` is
/// `(client_ms, server_ms)` and is rejected when only 1.0 is offered.
pub fn connect(
    login: Option<&str>,
    passcode: Option<&str>,
    headers: Option<&Headers>,
    versions: &[Version],
    host: Option<&str>,
    heart_beats: Option<(u64, u64)>,
) -> Result<Frame, ProtocolError> {
    build_connect(command::CONNECT, login, passcode, headers, versions, host, heart_beats)
}

/// Build a STOMP frame: synonymous to [`connect`], not supported in 1.0.
pub fn stomp(
    login: Option<&str>,
    passcode: Option<&str>,
    headers: Option<&Headers>,
    versions: &[Version],
    host: Option<&str>,
    heart_beats: Option<(u64, u64)>,
) -> Result<Frame, ProtocolError> {
    if sorted_versions(versions) == [Version::V1_0] {
        return Err(ProtocolError::UnsupportedCommand {
            command: command::STOMP,
            version: Version::V1_0,
        });
    }
    build_connect(command::STOMP, login, passcode, headers, versions, host, heart_beats)
}

fn build_connect(
    cmd: &'static str,
    login: Option<&str>,
    passcode: Option<&str>,
    headers: Option<&Headers>,
    versions: &[Version],
    host: Option<&str>,
    heart_beats: Option<(u64, u64)>,
) -> Result<Frame, ProtocolError> {
    let versions = sorted_versions(versions);
    let mut frame = Frame::new(cmd, headers.cloned().unwrap_or_default(), Vec::new());
    if let Some(login) = login {
        frame.set_header(header::LOGIN, login);
    }
    if let Some(passcode) = passcode {
        frame.set_header(header::PASSCODE, passcode);
    }
    if versions != [Version::V1_0] {
        let accepted = versions
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        frame.set_header(header::ACCEPT_VERSION, accepted);
        let host = host.ok_or(ProtocolError::MissingHost)?;
        frame.set_header(header::HOST, host);
    }
    if let Some((client, server)) = heart_beats {
        if versions == [Version::V1_0] {
            return Err(ProtocolError::HeartBeatsUnsupported(Version::V1_0));
        }
        frame.set_header(header::HEART_BEAT, format!("{client},{server}"));
    }
    Ok(frame)
}

/// Build a DISCONNECT frame.
pub fn disconnect(receipt: Option<&str>) -> Frame {
    let mut frame = Frame::new(command::DISCONNECT, Headers::new(), Vec::new());
    add_receipt_header(&mut frame, receipt);
    frame
}

/// Build a SEND frame.
pub fn send(
    destination: &str,
    body: Vec<u8>,
    headers: Option<&Headers>,
    receipt: Option<&str>,
) -> Frame {
    let mut frame = Frame::new(command::SEND, headers.cloned().unwrap_or_default(), body);
    frame.set_header(header::DESTINATION, destination);
    add_receipt_header(&mut frame, receipt);
    frame
}

/// Build a SUBSCRIBE frame and the token identifying the subscription.
///
/// The token must be kept to match incoming MESSAGE frames and to
/// unsubscribe later. 1.1+ requires an `id` header.
pub fn subscribe(
    destination: &str,
    headers: &Headers,
    receipt: Option<&str>,
    version: Version,
) -> Result<(Frame, SubscriptionToken), ProtocolError> {
    let mut frame = Frame::new(command::SUBSCRIBE, headers.clone(), Vec::new());
    frame.set_header(header::DESTINATION, destination);
    add_receipt_header(&mut frame, receipt);
    let token = match frame.header(header::ID) {
        Some(id) => SubscriptionToken::id(id),
        None if version == Version::V1_0 => SubscriptionToken::destination(destination),
        None => {
            return Err(ProtocolError::MissingHeader {
                command: command::SUBSCRIBE.to_owned(),
                header: header::ID,
                version: Some(version),
            });
        }
    };
    Ok((frame, token))
}

/// Build an UNSUBSCRIBE frame for a previously obtained token.
pub fn unsubscribe(
    token: &SubscriptionToken,
    receipt: Option<&str>,
    version: Version,
) -> Result<Frame, ProtocolError> {
    if token.kind == TokenKind::Destination && version != Version::V1_0 {
        return Err(ProtocolError::MissingHeader {
            command: command::UNSUBSCRIBE.to_owned(),
            header: header::ID,
            version: Some(version),
        });
    }
    let mut frame = Frame::new(
        command::UNSUBSCRIBE,
        vec![(token.header_name().to_owned(), token.value.clone())],
        Vec::new(),
    );
    add_receipt_header(&mut frame, receipt);
    Ok(frame)
}

/// Build an ACK frame for a received MESSAGE frame.
///
/// The `transaction` header is carried over only when the message's
/// transaction is in the caller's set of active transactions.
pub fn ack(
    frame: &Frame,
    transactions: &HashSet<String>,
    receipt: Option<&str>,
    version: Version,
) -> Result<Frame, ProtocolError> {
    let mut out = Frame::new(command::ACK, ack_headers(frame, transactions, version)?, Vec::new());
    add_receipt_header(&mut out, receipt);
    Ok(out)
}

/// Build a NACK frame for a received MESSAGE frame. Not supported in 1.0.
pub fn nack(
    frame: &Frame,
    transactions: &HashSet<String>,
    receipt: Option<&str>,
    version: Version,
) -> Result<Frame, ProtocolError> {
    if version == Version::V1_0 {
        return Err(ProtocolError::UnsupportedCommand {
            command: command::NACK,
            version,
        });
    }
    let mut out = Frame::new(command::NACK, ack_headers(frame, transactions, version)?, Vec::new());
    add_receipt_header(&mut out, receipt);
    Ok(out)
}

/// Build a BEGIN frame.
pub fn begin(transaction: &str, receipt: Option<&str>) -> Frame {
    transaction_frame(command::BEGIN, transaction, receipt)
}

/// Build an ABORT frame.
pub fn abort(transaction: &str, receipt: Option<&str>) -> Frame {
    transaction_frame(command::ABORT, transaction, receipt)
}

/// Build a COMMIT frame.
pub fn commit(transaction: &str, receipt: Option<&str>) -> Frame {
    transaction_frame(command::COMMIT, transaction, receipt)
}

/// Build a heart-beat. Not supported in 1.0.
pub fn beat(version: Version) -> Result<Transmission, ProtocolError> {
    if version == Version::V1_0 {
        return Err(ProtocolError::HeartBeatsUnsupported(version));
    }
    Ok(Transmission::HeartBeat)
}

fn transaction_frame(cmd: &'static str, transaction: &str, receipt: Option<&str>) -> Frame {
    let mut frame = Frame::new(
        cmd,
        vec![(header::TRANSACTION.to_owned(), transaction.to_owned())],
        Vec::new(),
    );
    add_receipt_header(&mut frame, receipt);
    frame
}

fn ack_headers(
    frame: &Frame,
    transactions: &HashSet<String>,
    version: Version,
) -> Result<Headers, ProtocolError> {
    check_command(frame, command::MESSAGE)?;
    check_header(frame, header::MESSAGE_ID, Some(version))?;
    if version != Version::V1_0 {
        check_header(frame, header::SUBSCRIPTION, Some(version))?;
    }
    let mut headers: Headers = frame
        .headers()
        .into_iter()
        .filter(|(name, _)| *name == header::SUBSCRIPTION || *name == header::MESSAGE_ID)
        .map(|(n, v)| (n.to_owned(), v.to_owned()))
        .collect();
    if let Some(transaction) = frame.header(header::TRANSACTION) {
        if transactions.contains(transaction) {
            headers.push((header::TRANSACTION.to_owned(), transaction.to_owned()));
        }
    }
    Ok(headers)
}

/// A non-empty `receipt` argument becomes a `receipt` header; an empty one
/// is treated as absent.
fn add_receipt_header(frame: &mut Frame, receipt: Option<&str>) {
    if let Some(receipt) = receipt {
        if !receipt.is_empty() {
            frame.set_header(header::RECEIPT, receipt);
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming validators
// ---------------------------------------------------------------------------

/// Validate a CONNECTED frame against the versions offered in CONNECT.
///
/// Returns the negotiated version, the server signature (1.1+), the broker
/// session id, and the server's `(client, server)` heart-beat proposal in
/// milliseconds.
pub fn connected(
    frame: &Frame,
    versions: &[Version],
) -> Result<(Version, Option<String>, Option<String>, (u64, u64)), ProtocolError> {
    check_command(frame, command::CONNECTED)?;
    let versions = sorted_versions(versions);
    let upper = *versions.last().expect("at least one version offered");

    let version = if upper == Version::V1_0 {
        Version::V1_0
    } else {
        let raw = frame.header(header::VERSION).unwrap_or(Version::V1_0.as_str());
        let version: Version = raw.parse().map_err(|_| ProtocolError::IncompatibleVersion {
            got: raw.to_owned(),
            offered: versions.clone(),
        })?;
        if !versions.contains(&version) {
            return Err(ProtocolError::IncompatibleVersion {
                got: raw.to_owned(),
                offered: versions,
            });
        }
        version
    };

    let session = frame.header(header::SESSION).map(str::to_owned);
    let server = if version == Version::V1_0 {
        None
    } else {
        frame.header(header::SERVER).map(str::to_owned)
    };

    let mut heart_beats = (0, 0);
    if version != Version::V1_0 {
        if let Some(raw) = frame.header(header::HEART_BEAT) {
            heart_beats = parse_heart_beats(raw)?;
        }
    }

    Ok((version, server, session, heart_beats))
}

/// Validate a MESSAGE frame; returns the token matching its subscription.
pub fn message(frame: &Frame, version: Version) -> Result<SubscriptionToken, ProtocolError> {
    check_command(frame, command::MESSAGE)?;
    check_header(frame, header::MESSAGE_ID, None)?;
    let destination = check_header(frame, header::DESTINATION, None)?;
    match frame.header(header::SUBSCRIPTION) {
        Some(subscription) => Ok(SubscriptionToken::id(subscription)),
        None if version == Version::V1_0 => Ok(SubscriptionToken::destination(destination)),
        None => Err(ProtocolError::MissingHeader {
            command: command::MESSAGE.to_owned(),
            header: header::SUBSCRIPTION,
            version: Some(version),
        }),
    }
}

/// Validate a RECEIPT frame; returns the receipt id.
pub fn receipt(frame: &Frame, _version: Version) -> Result<String, ProtocolError> {
    check_command(frame, command::RECEIPT)?;
    Ok(check_header(frame, header::RECEIPT_ID, None)?.to_owned())
}

/// Validate an ERROR frame. Checks the command only.
pub fn error(frame: &Frame, _version: Version) -> Result<(), ProtocolError> {
    check_command(frame, command::ERROR)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sorted_versions(versions: &[Version]) -> Vec<Version> {
    if versions.is_empty() {
        return vec![Version::V1_0];
    }
    let mut versions = versions.to_vec();
    versions.sort_unstable();
    versions.dedup();
    versions
}

fn parse_heart_beats(raw: &str) -> Result<(u64, u64), ProtocolError> {
    let invalid = || ProtocolError::InvalidHeartBeat(raw.to_owned());
    let (client, server) = raw.split_once(HEART_BEAT_SEPARATOR).ok_or_else(invalid)?;
    let client = client.trim().parse::<u64>().map_err(|_| invalid())?;
    let server = server.trim().parse::<u64>().map_err(|_| invalid())?;
    Ok((client, server))
}

fn check_command(frame: &Frame, expected: &'static str) -> Result<(), ProtocolError> {
    if frame.command != expected {
        return Err(ProtocolError::UnexpectedCommand {
            got: frame.command.clone(),
            expected,
        });
    }
    Ok(())
}

fn check_header<'a>(
    frame: &'a Frame,
    name: &'static str,
    version: Option<Version>,
) -> Result<&'a str, ProtocolError> {
    frame.header(name).ok_or_else(|| ProtocolError::MissingHeader {
        command: frame.command.clone(),
        header: name,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_1_0_omits_accept_version_and_host() {
        let frame = connect(Some("user"), Some("pass"), None, &[Version::V1_0], None, None)
            .unwrap();
        assert_eq!(frame.command, "CONNECT");
        assert_eq!(frame.header(header::LOGIN), Some("user"));
        assert_eq!(frame.header(header::PASSCODE), Some("pass"));
        assert_eq!(frame.header(header::ACCEPT_VERSION), None);
        assert_eq!(frame.header(header::HOST), None);
    }

    #[test]
    fn connect_1_2_offers_all_versions_and_requires_host() {
        let versions: Vec<_> = Version::V1_2.upto().collect();
        let frame = connect(None, None, None, &versions, Some("earth"), Some((100, 200)))
            .unwrap();
        assert_eq!(frame.header(header::ACCEPT_VERSION), Some("1.0,1.1,1.2"));
        assert_eq!(frame.header(header::HOST), Some("earth"));
        assert_eq!(frame.header(header::HEART_BEAT), Some("100,200"));

        assert_eq!(
            connect(None, None, None, &versions, None, None),
            Err(ProtocolError::MissingHost)
        );
    }

    #[test]
    fn heart_beats_rejected_under_1_0() {
        assert_eq!(
            connect(None, None, None, &[Version::V1_0], None, Some((100, 200))),
            Err(ProtocolError::HeartBeatsUnsupported(Version::V1_0))
        );
        assert!(beat(Version::V1_0).is_err());
        assert_eq!(beat(Version::V1_1), Ok(Transmission::HeartBeat));
    }

    #[test]
    fn stomp_rejected_under_1_0() {
        assert!(stomp(None, None, None, &[Version::V1_0], None, None).is_err());
        let frame = stomp(None, None, None, &[Version::V1_0, Version::V1_1], Some("earth"), None)
            .unwrap();
        assert_eq!(frame.command, "STOMP");
    }

    #[test]
    fn subscribe_tokens_depend_on_version() {
        let headers = vec![(header::ACK.to_owned(), "client".to_owned())];
        let (frame, token) =
            subscribe("/queue/test", &headers, None, Version::V1_0).unwrap();
        assert_eq!(frame.header(header::DESTINATION), Some("/queue/test"));
        assert_eq!(token, SubscriptionToken::destination("/queue/test"));

        assert!(subscribe("/queue/test", &headers, None, Version::V1_1).is_err());

        let headers = vec![(header::ID.to_owned(), "0".to_owned())];
        let (_, token) = subscribe("/queue/test", &headers, None, Version::V1_1).unwrap();
        assert_eq!(token, SubscriptionToken::id("0"));
    }

    #[test]
    fn unsubscribe_by_destination_only_in_1_0() {
        let token = SubscriptionToken::destination("/queue/test");
        let frame = unsubscribe(&token, None, Version::V1_0).unwrap();
        assert_eq!(frame.header(header::DESTINATION), Some("/queue/test"));
        assert!(unsubscribe(&token, None, Version::V1_1).is_err());

        let token = SubscriptionToken::id("0");
        let frame = unsubscribe(&token, Some("r-1"), Version::V1_1).unwrap();
        assert_eq!(frame.header(header::ID), Some("0"));
        assert_eq!(frame.header(header::RECEIPT), Some("r-1"));
    }

    #[test]
    fn ack_copies_subscription_and_message_id() {
        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::SUBSCRIPTION.to_owned(), "0".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
                (header::DESTINATION.to_owned(), "/queue/a".to_owned()),
            ],
            Vec::new(),
        );
        let frame = ack(&message, &HashSet::new(), None, Version::V1_1).unwrap();
        assert_eq!(frame.command, "ACK");
        assert_eq!(frame.header(header::SUBSCRIPTION), Some("0"));
        assert_eq!(frame.header(header::MESSAGE_ID), Some("007"));
        assert_eq!(frame.header(header::DESTINATION), None);
    }

    #[test]
    fn ack_carries_transaction_only_when_active() {
        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::SUBSCRIPTION.to_owned(), "0".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
                (header::TRANSACTION.to_owned(), "tx1".to_owned()),
            ],
            Vec::new(),
        );
        let inactive = ack(&message, &HashSet::new(), None, Version::V1_1).unwrap();
        assert_eq!(inactive.header(header::TRANSACTION), None);

        let active: HashSet<String> = ["tx1".to_owned()].into();
        let in_tx = ack(&message, &active, None, Version::V1_1).unwrap();
        assert_eq!(in_tx.header(header::TRANSACTION), Some("tx1"));
    }

    #[test]
    fn nack_rejected_under_1_0() {
        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::SUBSCRIPTION.to_owned(), "0".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
            ],
            Vec::new(),
        );
        assert!(nack(&message, &HashSet::new(), None, Version::V1_0).is_err());
        assert!(nack(&message, &HashSet::new(), None, Version::V1_1).is_ok());
    }

    #[test]
    fn empty_receipt_is_treated_as_absent() {
        let frame = disconnect(Some(""));
        assert_eq!(frame.header(header::RECEIPT), None);
        let frame = disconnect(Some("message-12345"));
        assert_eq!(frame.header(header::RECEIPT), Some("message-12345"));
    }

    #[test]
    fn connected_negotiates_the_version() {
        let versions = [Version::V1_0, Version::V1_1];
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::VERSION.to_owned(), "1.1".to_owned()),
                (header::SESSION.to_owned(), "s-1".to_owned()),
                (header::SERVER.to_owned(), "mock/1".to_owned()),
                (header::HEART_BEAT.to_owned(), "500,700".to_owned()),
            ],
            Vec::new(),
        );
        let (version, server, session, beats) = connected(&frame, &versions).unwrap();
        assert_eq!(version, Version::V1_1);
        assert_eq!(server.as_deref(), Some("mock/1"));
        assert_eq!(session.as_deref(), Some("s-1"));
        assert_eq!(beats, (500, 700));
    }

    #[test]
    fn connected_rejects_a_version_outside_the_offer() {
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![(header::VERSION.to_owned(), "1.2".to_owned())],
            Vec::new(),
        );
        assert!(matches!(
            connected(&frame, &[Version::V1_0, Version::V1_1]),
            Err(ProtocolError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn connected_under_1_0_ignores_version_and_server() {
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::SESSION.to_owned(), "s-1".to_owned()),
                (header::SERVER.to_owned(), "mock/1".to_owned()),
            ],
            Vec::new(),
        );
        let (version, server, session, beats) = connected(&frame, &[Version::V1_0]).unwrap();
        assert_eq!(version, Version::V1_0);
        assert_eq!(server, None);
        assert_eq!(session.as_deref(), Some("s-1"));
        assert_eq!(beats, (0, 0));
    }

    #[test]
    fn connected_rejects_malformed_heart_beats() {
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::VERSION.to_owned(), "1.1".to_owned()),
                (header::HEART_BEAT.to_owned(), "alpha,100".to_owned()),
            ],
            Vec::new(),
        );
        assert!(matches!(
            connected(&frame, &[Version::V1_0, Version::V1_1]),
            Err(ProtocolError::InvalidHeartBeat(_))
        ));
    }

    #[test]
    fn message_token_matches_the_subscription() {
        let frame = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::DESTINATION.to_owned(), "/queue/test".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
            ],
            Vec::new(),
        );
        assert_eq!(
            message(&frame, Version::V1_0).unwrap(),
            SubscriptionToken::destination("/queue/test")
        );
        assert!(matches!(
            message(&frame, Version::V1_1),
            Err(ProtocolError::MissingHeader { header: "subscription", .. })
        ));
    }

    #[test]
    fn receipt_requires_receipt_id() {
        let frame = Frame::with_raw_headers(
            command::RECEIPT,
            vec![(header::RECEIPT_ID.to_owned(), "r-7".to_owned())],
            Vec::new(),
        );
        assert_eq!(receipt(&frame, Version::V1_0).unwrap(), "r-7");

        let frame = Frame::with_raw_headers(command::RECEIPT, Headers::new(), Vec::new());
        assert!(receipt(&frame, Version::V1_0).is_err());
    }
}
