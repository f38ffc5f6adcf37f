//! Transport-agnostic STOMP session state machine.
//!
//! A [`Session`] owns everything the protocol requires a client to
//! remember (connection phase, negotiated version, subscriptions, pending
//! receipts, active transactions, heart-beat bookkeeping) and nothing
//! about sockets. Outbound operations emit the frame to write; inbound
//! callbacks validate what arrived and update the state.
//!
//! Subscriptions carry an opaque context of type `C`: clients use it to
//! route incoming MESSAGE frames back to whoever subscribed. After an
//! unexpected connection loss the registry survives, so [`Session::replay`]
//! can re-issue every SUBSCRIBE on the next connect.

use std::collections::HashSet;
use std::time::Instant;

use crate::commands::{self, SubscriptionToken};
use crate::error::ProtocolError;
use crate::frame::{Frame, Headers, Transmission};
use crate::spec::{Version, header};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One registered subscription: what was sent to the broker, plus the
/// caller's routing context.
#[derive(Debug, Clone)]
pub struct Subscription<C> {
    pub destination: String,
    pub headers: Headers,
    pub receipt: Option<String>,
    pub context: C,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Full protocol state of one STOMP connection.
#[derive(Debug)]
pub struct Session<C> {
    version: Version,
    check: bool,
    state: SessionState,
    negotiated: Option<Version>,
    server: Option<String>,
    id: Option<String>,
    versions: Vec<Version>,
    subscriptions: Vec<(SubscriptionToken, Subscription<C>)>,
    receipts: HashSet<String>,
    transactions: HashSet<String>,
    failed: bool,
    proposed_heart_beats: (u64, u64),
    client_heart_beat: u64,
    server_heart_beat: u64,
    last_sent: Instant,
    last_received: Instant,
}

impl<C: Clone> Session<C> {
    /// A fresh, disconnected session negotiating at most `version`.
    ///
    /// `check = false` disables structural validation: every operation
    /// becomes a raw pass-through (bridges and tests).
    pub fn new(version: Version, check: bool) -> Session<C> {
        let now = Instant::now();
        Session {
            version,
            check,
            state: SessionState::Disconnected,
            negotiated: None,
            server: None,
            id: None,
            versions: Vec::new(),
            subscriptions: Vec::new(),
            receipts: HashSet::new(),
            transactions: HashSet::new(),
            failed: false,
            proposed_heart_beats: (0, 0),
            client_heart_beat: 0,
            server_heart_beat: 0,
            last_sent: now,
            last_received: now,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The negotiated version once connected, the upper bound before.
    pub fn version(&self) -> Version {
        self.negotiated.unwrap_or(self.version)
    }

    /// The broker's server signature (1.1+).
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// The broker-assigned session id.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Receipt ids sent but not yet confirmed by a RECEIPT frame.
    pub fn pending_receipts(&self) -> impl Iterator<Item = &str> {
        self.receipts.iter().map(String::as_str)
    }

    /// Active transaction ids.
    pub fn active_transactions(&self) -> impl Iterator<Item = &str> {
        self.transactions.iter().map(String::as_str)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// The subscription registered under `token`.
    pub fn subscription(&self, token: &SubscriptionToken) -> Option<&Subscription<C>> {
        self.subscriptions
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, s)| s)
    }

    // -----------------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------------

    /// Build the CONNECT frame and move to `Connecting`.
    ///
    /// `versions` defaults to every version up to the session's bound.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        login: Option<&str>,
        passcode: Option<&str>,
        headers: Option<&Headers>,
        versions: Option<&[Version]>,
        host: Option<&str>,
        heart_beats: Option<(u64, u64)>,
    ) -> Result<Frame, ProtocolError> {
        self.expect_state("connect", &[SessionState::Disconnected])?;
        let versions: Vec<Version> = match versions {
            Some(versions) => versions.to_vec(),
            None => self.version.upto().collect(),
        };
        let frame = commands::connect(login, passcode, headers, &versions, host, heart_beats)?;
        self.versions = versions;
        self.proposed_heart_beats = heart_beats.unwrap_or((0, 0));
        self.state = SessionState::Connecting;
        Ok(self.stamp(frame))
    }

    /// Build the DISCONNECT frame and move to `Disconnecting`.
    ///
    /// Subscriptions are cleared unless a failure was flagged beforehand, so
    /// a clean disconnect does not replay while a failing one does.
    pub fn disconnect(&mut self, receipt: Option<&str>) -> Result<Frame, ProtocolError> {
        self.expect_state("disconnect", &[SessionState::Connected])?;
        let frame = commands::disconnect(receipt);
        self.register_receipt(&frame)?;
        if !self.failed {
            self.subscriptions.clear();
        }
        self.state = SessionState::Disconnecting;
        Ok(self.stamp(frame))
    }

    pub fn send(
        &mut self,
        destination: &str,
        body: Vec<u8>,
        headers: Option<&Headers>,
        receipt: Option<&str>,
    ) -> Result<Frame, ProtocolError> {
        self.expect_state("send", &[SessionState::Connected])?;
        let frame = commands::send(destination, body, headers, receipt);
        self.register_receipt(&frame)?;
        Ok(self.stamp(frame))
    }

    /// Build a SUBSCRIBE frame and register the subscription under its
    /// token. The context routes later MESSAGE frames back to the caller.
    pub fn subscribe(
        &mut self,
        destination: &str,
        headers: &Headers,
        receipt: Option<&str>,
        context: C,
    ) -> Result<(Frame, SubscriptionToken), ProtocolError> {
        self.expect_state("subscribe", &[SessionState::Connected])?;
        let (frame, token) = commands::subscribe(destination, headers, receipt, self.version())?;
        if self.check && self.subscription(&token).is_some() {
            return Err(ProtocolError::DuplicateSubscription(token.to_string()));
        }
        self.register_receipt(&frame)?;
        self.subscriptions.push((
            token.clone(),
            Subscription {
                destination: destination.to_owned(),
                headers: headers.clone(),
                receipt: receipt.filter(|r| !r.is_empty()).map(str::to_owned),
                context,
            },
        ));
        Ok((self.stamp(frame), token))
    }

    /// Build an UNSUBSCRIBE frame and drop the registration.
    pub fn unsubscribe(
        &mut self,
        token: &SubscriptionToken,
        receipt: Option<&str>,
    ) -> Result<Frame, ProtocolError> {
        self.expect_state("unsubscribe", &[SessionState::Connected])?;
        let position = self.subscriptions.iter().position(|(t, _)| t == token);
        match position {
            Some(position) => {
                self.subscriptions.remove(position);
            }
            None if self.check => {
                return Err(ProtocolError::UnknownSubscription(token.to_string()));
            }
            None => {}
        }
        let frame = commands::unsubscribe(token, receipt, self.version())?;
        self.register_receipt(&frame)?;
        Ok(self.stamp(frame))
    }

    pub fn ack(&mut self, frame: &Frame, receipt: Option<&str>) -> Result<Frame, ProtocolError> {
        self.expect_state("ack", &[SessionState::Connected, SessionState::Disconnecting])?;
        let out = commands::ack(frame, &self.transactions, receipt, self.version())?;
        self.register_receipt(&out)?;
        Ok(self.stamp(out))
    }

    pub fn nack(&mut self, frame: &Frame, receipt: Option<&str>) -> Result<Frame, ProtocolError> {
        self.expect_state("nack", &[SessionState::Connected, SessionState::Disconnecting])?;
        let out = commands::nack(frame, &self.transactions, receipt, self.version())?;
        self.register_receipt(&out)?;
        Ok(self.stamp(out))
    }

    pub fn begin(
        &mut self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Frame, ProtocolError> {
        self.expect_state("begin", &[SessionState::Connected])?;
        if !self.transactions.insert(transaction.to_owned()) && self.check {
            return Err(ProtocolError::DuplicateTransaction(transaction.to_owned()));
        }
        let frame = commands::begin(transaction, receipt);
        self.register_receipt(&frame)?;
        Ok(self.stamp(frame))
    }

    pub fn abort(
        &mut self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Frame, ProtocolError> {
        self.end_transaction(transaction)?;
        let frame = commands::abort(transaction, receipt);
        self.register_receipt(&frame)?;
        Ok(self.stamp(frame))
    }

    pub fn commit(
        &mut self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Frame, ProtocolError> {
        self.end_transaction(transaction)?;
        let frame = commands::commit(transaction, receipt);
        self.register_receipt(&frame)?;
        Ok(self.stamp(frame))
    }

    /// A client-to-server heart-beat.
    pub fn beat(&self) -> Result<Transmission, ProtocolError> {
        if self.check {
            self.expect_state("beat", &[SessionState::Connected])?;
        }
        commands::beat(self.version())
    }

    // -----------------------------------------------------------------------
    // Inbound callbacks
    // -----------------------------------------------------------------------

    /// Validate a CONNECTED frame: negotiate version and heart-beats, store
    /// the broker identifiers, move to `Connected`.
    pub fn on_connected(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.expect_state("CONNECTED handling", &[SessionState::Connecting])?;
        let versions = if self.versions.is_empty() {
            vec![self.version]
        } else {
            self.versions.clone()
        };
        let (version, server, id, server_beats) = commands::connected(frame, &versions)?;
        self.negotiated = Some(version);
        self.server = server;
        self.id = id;
        // Effective periods: each direction needs both sides non-zero and
        // runs at the slower of the two proposals.
        let (proposed_client, proposed_server) = self.proposed_heart_beats;
        let (server_client, server_server) = server_beats;
        self.client_heart_beat = if proposed_client == 0 || server_server == 0 {
            0
        } else {
            proposed_client.max(server_server)
        };
        self.server_heart_beat = if server_client == 0 || proposed_server == 0 {
            0
        } else {
            server_client.max(proposed_server)
        };
        self.state = SessionState::Connected;
        let now = Instant::now();
        self.last_sent = now;
        self.last_received = now;
        Ok(())
    }

    /// Validate a MESSAGE frame; returns the token of the subscription it
    /// belongs to. Unknown tokens are protocol errors.
    pub fn on_message(&mut self, frame: &Frame) -> Result<SubscriptionToken, ProtocolError> {
        self.expect_state(
            "MESSAGE handling",
            &[SessionState::Connected, SessionState::Disconnecting],
        )?;
        let token = commands::message(frame, self.version())?;
        if self.check && self.subscription(&token).is_none() {
            return Err(ProtocolError::UnknownSubscription(token.to_string()));
        }
        Ok(token)
    }

    /// Validate a RECEIPT frame and clear the pending receipt it confirms.
    pub fn on_receipt(&mut self, frame: &Frame) -> Result<String, ProtocolError> {
        self.expect_state(
            "RECEIPT handling",
            &[SessionState::Connected, SessionState::Disconnecting],
        )?;
        let id = commands::receipt(frame, self.version())?;
        if !self.receipts.remove(&id) && self.check {
            return Err(ProtocolError::UnknownReceipt(id));
        }
        Ok(id)
    }

    /// Validate an ERROR frame. The caller decides whether to disconnect.
    pub fn on_error(&self, frame: &Frame) -> Result<(), ProtocolError> {
        commands::error(frame, self.version())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Enumerate the registered subscriptions in insertion order, clearing
    /// the registry. A subsequent connect re-subscribes each entry (which
    /// re-registers it under a fresh token).
    pub fn replay(&mut self) -> Vec<(String, Headers, Option<String>, C)> {
        std::mem::take(&mut self.subscriptions)
            .into_iter()
            .map(|(_, s)| (s.destination, s.headers, s.receipt, s.context))
            .collect()
    }

    /// Flag that this session failed; the next [`Session::disconnect`]
    /// keeps the subscriptions so they can be replayed after reconnect.
    pub fn flag_failure(&mut self) {
        self.failed = true;
    }

    /// Whether a failure was flagged since the last [`Session::close`].
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Drop connection-scoped state and return to `Disconnected`.
    ///
    /// `flush = true` also drops the subscriptions; `flush = false` keeps
    /// them for [`Session::replay`] after the next connect.
    pub fn close(&mut self, flush: bool) {
        self.state = SessionState::Disconnected;
        self.negotiated = None;
        self.server = None;
        self.id = None;
        self.receipts.clear();
        self.transactions.clear();
        self.client_heart_beat = 0;
        self.server_heart_beat = 0;
        self.failed = false;
        if flush {
            self.subscriptions.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Heart-beat bookkeeping
    // -----------------------------------------------------------------------

    /// Record outgoing wire activity.
    pub fn sent(&mut self) {
        self.last_sent = Instant::now();
    }

    /// Record incoming wire activity.
    pub fn received(&mut self) {
        self.last_received = Instant::now();
    }

    /// Effective client-to-server heart-beat period in ms (0 = disabled).
    pub fn client_heart_beat(&self) -> u64 {
        self.client_heart_beat
    }

    /// Effective server-to-client heart-beat period in ms (0 = disabled).
    pub fn server_heart_beat(&self) -> u64 {
        self.server_heart_beat
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Stamp the frame with the session's effective version so that
    /// serialization applies the right escape table and codec.
    fn stamp(&self, mut frame: Frame) -> Frame {
        frame.version = self.version();
        frame
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), ProtocolError> {
        if !self.check || allowed.contains(&self.state) {
            return Ok(());
        }
        Err(ProtocolError::WrongState {
            operation,
            state: self.state.name(),
        })
    }

    fn end_transaction(&mut self, transaction: &str) -> Result<(), ProtocolError> {
        self.expect_state("transaction end", &[SessionState::Connected])?;
        if !self.transactions.remove(transaction) && self.check {
            return Err(ProtocolError::UnknownTransaction(transaction.to_owned()));
        }
        Ok(())
    }

    fn register_receipt(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if let Some(receipt) = frame.header(header::RECEIPT) {
            if !self.receipts.insert(receipt.to_owned()) && self.check {
                return Err(ProtocolError::DuplicateReceipt(receipt.to_owned()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::command;

    fn connected_frame(version: &str) -> Frame {
        Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::VERSION.to_owned(), version.to_owned()),
                (header::SESSION.to_owned(), "session-1".to_owned()),
                (header::SERVER.to_owned(), "mock/1.0".to_owned()),
            ],
            Vec::new(),
        )
    }

    fn connected_session(version: Version) -> Session<&'static str> {
        let mut session = Session::new(version, true);
        session
            .connect(None, None, None, None, Some("earth"), None)
            .unwrap();
        session.on_connected(&connected_frame(version.as_str())).unwrap();
        session
    }

    #[test]
    fn lifecycle_disconnected_to_connected() {
        let mut session: Session<()> = Session::new(Version::V1_1, true);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.send("/queue/a", Vec::new(), None, None).is_err());

        let frame = session
            .connect(Some("user"), None, None, None, Some("earth"), None)
            .unwrap();
        assert_eq!(frame.command, "CONNECT");
        assert_eq!(session.state(), SessionState::Connecting);

        session.on_connected(&connected_frame("1.1")).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.version(), Version::V1_1);
        assert_eq!(session.id(), Some("session-1"));
        assert_eq!(session.server(), Some("mock/1.0"));
    }

    #[test]
    fn second_connect_is_a_wrong_state_error() {
        let mut session = connected_session(Version::V1_1);
        assert!(matches!(
            session.connect(None, None, None, None, Some("earth"), None),
            Err(ProtocolError::WrongState { .. })
        ));
    }

    #[test]
    fn outgoing_frames_carry_the_negotiated_version() {
        let mut session = connected_session(Version::V1_2);
        let frame = session.send("/queue/a", b"hi".to_vec(), None, None).unwrap();
        assert_eq!(frame.version, Version::V1_2);
    }

    #[test]
    fn receipt_bookkeeping_gains_and_loses_ids() {
        let mut session = connected_session(Version::V1_1);
        session
            .send("/queue/a", Vec::new(), None, Some("r-1"))
            .unwrap();
        assert_eq!(session.pending_receipts().collect::<Vec<_>>(), vec!["r-1"]);

        let receipt = Frame::with_raw_headers(
            command::RECEIPT,
            vec![(header::RECEIPT_ID.to_owned(), "r-1".to_owned())],
            Vec::new(),
        );
        assert_eq!(session.on_receipt(&receipt).unwrap(), "r-1");
        assert_eq!(session.pending_receipts().count(), 0);

        // A second identical RECEIPT is unexpected now.
        assert!(matches!(
            session.on_receipt(&receipt),
            Err(ProtocolError::UnknownReceipt(_))
        ));
    }

    #[test]
    fn duplicate_pending_receipt_is_rejected() {
        let mut session = connected_session(Version::V1_1);
        session
            .send("/queue/a", Vec::new(), None, Some("r-1"))
            .unwrap();
        assert!(matches!(
            session.send("/queue/b", Vec::new(), None, Some("r-1")),
            Err(ProtocolError::DuplicateReceipt(_))
        ));
    }

    #[test]
    fn message_routing_requires_a_known_token() {
        let mut session = connected_session(Version::V1_1);
        let headers = vec![(header::ID.to_owned(), "sub-0".to_owned())];
        let (_, token) = session
            .subscribe("/queue/test", &headers, None, "ctx")
            .unwrap();

        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::DESTINATION.to_owned(), "/queue/test".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
                (header::SUBSCRIPTION.to_owned(), "sub-0".to_owned()),
            ],
            Vec::new(),
        );
        assert_eq!(session.on_message(&message).unwrap(), token);
        assert_eq!(session.subscription(&token).unwrap().context, "ctx");

        let unknown = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::DESTINATION.to_owned(), "/queue/test".to_owned()),
                (header::MESSAGE_ID.to_owned(), "008".to_owned()),
                (header::SUBSCRIPTION.to_owned(), "sub-9".to_owned()),
            ],
            Vec::new(),
        );
        assert!(matches!(
            session.on_message(&unknown),
            Err(ProtocolError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn v1_0_messages_match_by_destination() {
        let mut session = connected_session(Version::V1_0);
        let (_, token) = session
            .subscribe("/queue/test", &Headers::new(), None, "ctx")
            .unwrap();
        assert_eq!(token, SubscriptionToken::destination("/queue/test"));

        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::DESTINATION.to_owned(), "/queue/test".to_owned()),
                (header::MESSAGE_ID.to_owned(), "007".to_owned()),
            ],
            Vec::new(),
        );
        assert_eq!(session.on_message(&message).unwrap(), token);
    }

    #[test]
    fn replay_enumerates_in_insertion_order_and_clears() {
        let mut session = connected_session(Version::V1_1);
        for n in 0..3 {
            let headers = vec![(header::ID.to_owned(), format!("sub-{n}"))];
            session
                .subscribe(&format!("/queue/{n}"), &headers, None, "ctx")
                .unwrap();
        }
        let replayed = session.replay();
        assert_eq!(session.subscription_count(), 0);
        let destinations: Vec<_> = replayed.iter().map(|(d, ..)| d.as_str()).collect();
        assert_eq!(destinations, vec!["/queue/0", "/queue/1", "/queue/2"]);

        // Re-subscribing the same entries replays identically.
        for (destination, headers, receipt, context) in replayed.clone() {
            session
                .subscribe(&destination, &headers, receipt.as_deref(), context)
                .unwrap();
        }
        let again = session.replay();
        let destinations: Vec<_> = again.iter().map(|(d, ..)| d.as_str()).collect();
        assert_eq!(destinations, vec!["/queue/0", "/queue/1", "/queue/2"]);
    }

    #[test]
    fn clean_disconnect_clears_subscriptions_failed_disconnect_keeps_them() {
        let mut session = connected_session(Version::V1_1);
        let headers = vec![(header::ID.to_owned(), "sub-0".to_owned())];
        session
            .subscribe("/queue/test", &headers, None, "ctx")
            .unwrap();

        let mut clean = connected_session(Version::V1_1);
        clean.subscribe("/queue/test", &headers, None, "ctx").unwrap();
        clean.disconnect(None).unwrap();
        assert_eq!(clean.subscription_count(), 0);

        session.flag_failure();
        session.disconnect(None).unwrap();
        assert_eq!(session.subscription_count(), 1);
        session.close(false);
        assert_eq!(session.subscription_count(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.close(true);
        assert_eq!(session.subscription_count(), 0);
    }

    #[test]
    fn transactions_track_begin_commit_abort() {
        let mut session = connected_session(Version::V1_1);
        session.begin("tx1", None).unwrap();
        assert!(matches!(
            session.begin("tx1", None),
            Err(ProtocolError::DuplicateTransaction(_))
        ));
        session.commit("tx1", None).unwrap();
        assert!(matches!(
            session.abort("tx1", None),
            Err(ProtocolError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn heart_beat_negotiation_takes_the_slower_period() {
        let mut session: Session<()> = Session::new(Version::V1_1, true);
        session
            .connect(None, None, None, None, Some("earth"), Some((100, 300)))
            .unwrap();
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::VERSION.to_owned(), "1.1".to_owned()),
                (header::HEART_BEAT.to_owned(), "200,250".to_owned()),
            ],
            Vec::new(),
        );
        session.on_connected(&frame).unwrap();
        // Client sends every max(100, 250); server sends every max(200, 300).
        assert_eq!(session.client_heart_beat(), 250);
        assert_eq!(session.server_heart_beat(), 300);
    }

    #[test]
    fn zero_on_either_side_disables_a_direction() {
        let mut session: Session<()> = Session::new(Version::V1_1, true);
        session
            .connect(None, None, None, None, Some("earth"), Some((0, 300)))
            .unwrap();
        let frame = Frame::with_raw_headers(
            command::CONNECTED,
            vec![
                (header::VERSION.to_owned(), "1.1".to_owned()),
                (header::HEART_BEAT.to_owned(), "200,250".to_owned()),
            ],
            Vec::new(),
        );
        session.on_connected(&frame).unwrap();
        assert_eq!(session.client_heart_beat(), 0);
        assert_eq!(session.server_heart_beat(), 300);
    }

    #[test]
    fn unchecked_session_passes_everything_through() {
        let mut session: Session<()> = Session::new(Version::V1_1, false);
        // No state validation: sending while disconnected builds the frame.
        let frame = session.send("/queue/a", Vec::new(), None, None).unwrap();
        assert_eq!(frame.command, "SEND");
        // Unknown tokens are not checked either.
        let message = Frame::with_raw_headers(
            command::MESSAGE,
            vec![
                (header::DESTINATION.to_owned(), "/queue/a".to_owned()),
                (header::MESSAGE_ID.to_owned(), "1".to_owned()),
                (header::SUBSCRIPTION.to_owned(), "nope".to_owned()),
            ],
            Vec::new(),
        );
        assert!(session.on_message(&message).is_ok());
    }

    #[test]
    fn duplicate_subscription_token_is_rejected() {
        let mut session = connected_session(Version::V1_1);
        let headers = vec![(header::ID.to_owned(), "sub-0".to_owned())];
        session.subscribe("/queue/a", &headers, None, "a").unwrap();
        assert!(matches!(
            session.subscribe("/queue/b", &headers, None, "b"),
            Err(ProtocolError::DuplicateSubscription(_))
        ));
    }

    #[test]
    fn beat_is_gated_on_version() {
        let session = connected_session(Version::V1_0);
        assert!(session.beat().is_err());
        let session = connected_session(Version::V1_1);
        assert_eq!(session.beat().unwrap(), Transmission::HeartBeat);
    }
}
