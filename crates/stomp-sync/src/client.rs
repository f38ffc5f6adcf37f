//! Blocking STOMP client.
//!
//! A thin facade over a [`FrameTransport`] and a
//! [`Session`](stomp_protocol::session::Session): every verb builds its
//! frame through the session (which tracks receipts, subscriptions and
//! transactions) and writes it out. Connecting walks the failover iterator;
//! after an unexpected connection loss, the surviving subscriptions are
//! replayed on the next connect.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use stomp_protocol::commands::SubscriptionToken;
use stomp_protocol::config::Config;
use stomp_protocol::error::{ConnectionError, ProtocolError, StompError};
use stomp_protocol::failover::{Broker, FailoverIter};
use stomp_protocol::frame::{Frame, Headers, Transmission};
use stomp_protocol::session::{Session, SessionState};
use stomp_protocol::spec::{Version, command};

use crate::transport::{FrameTransport, SyncStream};

// ---------------------------------------------------------------------------
// StreamFactory
// ---------------------------------------------------------------------------

/// Opens the byte stream toward a broker. Implement this to wrap the socket
/// in TLS for `ssl://` brokers.
pub trait StreamFactory {
    type Stream: SyncStream;

    fn open(&self, broker: &Broker, timeout: Option<Duration>) -> io::Result<Self::Stream>;
}

/// Plain TCP.
#[derive(Debug, Default)]
pub struct TcpFactory;

impl StreamFactory for TcpFactory {
    type Stream = TcpStream;

    fn open(&self, broker: &Broker, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let stream = match timeout {
            Some(timeout) => {
                let addrs: Vec<_> = (broker.host.as_str(), broker.port)
                    .to_socket_addrs()?
                    .collect();
                let mut last = None;
                let mut connected = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last = Some(e),
                    }
                }
                connected.ok_or_else(|| {
                    last.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
                    })
                })?
            }
            None => TcpStream::connect((broker.host.as_str(), broker.port))?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Options for one connect attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub headers: Option<Headers>,
    pub versions: Option<Vec<Version>>,
    pub heart_beats: Option<(u64, u64)>,
    /// Bound for the wire-level TCP connect.
    pub connect_timeout: Option<Duration>,
    /// Bound for the wait on the broker's CONNECTED frame.
    pub connected_timeout: Option<Duration>,
}

/// A blocking STOMP client.
pub struct Client<F: StreamFactory = TcpFactory> {
    config: Config,
    factory: F,
    session: Session<()>,
    failover: FailoverIter,
    transport: Option<FrameTransport<F::Stream>>,
    /// Transmissions set aside while waiting for a specific receipt.
    pending: VecDeque<Transmission>,
    receipt_timeout: Option<Duration>,
}

impl Client<TcpFactory> {
    pub fn new(config: Config) -> Result<Client<TcpFactory>, StompError> {
        Client::with_factory(config, TcpFactory)
    }
}

impl<F: StreamFactory> Client<F> {
    pub fn with_factory(config: Config, factory: F) -> Result<Client<F>, StompError> {
        let failover = FailoverIter::new(config.failover()?);
        let session = Session::new(config.version, config.check);
        Ok(Client {
            config,
            factory,
            session,
            failover,
            transport: None,
            pending: VecDeque::new(),
            receipt_timeout: None,
        })
    }

    /// Default bound for [`Client::wait_for_receipt`]. `None` waits
    /// indefinitely.
    pub fn receipt_timeout(mut self, timeout: Duration) -> Client<F> {
        self.receipt_timeout = Some(timeout);
        self
    }

    pub fn session(&self) -> &Session<()> {
        &self.session
    }

    // -----------------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------------

    /// Connect to the first reachable broker of the failover list, negotiate
    /// the STOMP session, and replay any subscriptions that survived a
    /// previous unexpected connection loss.
    pub fn connect(&mut self, options: &ConnectOptions) -> Result<(), StompError> {
        let transport = self.open_transport(options.connect_timeout)?;
        self.transport = Some(transport);
        self.pending.clear();

        let host = self.config.virtual_host()?;
        let result = self.negotiate(options, &host);
        if result.is_err() {
            self.drop_transport(false);
        }
        result?;

        self.failover.reset();
        info!(
            session = self.session.id().unwrap_or("-"),
            version = %self.session.version(),
            "connected to stomp broker"
        );

        for (destination, headers, receipt, ()) in self.session.replay() {
            debug!(destination = %destination, "replaying subscription");
            self.subscribe(&destination, &headers, receipt.as_deref())?;
        }
        Ok(())
    }

    /// Send DISCONNECT, optionally wait for its receipt, and close the
    /// socket.
    pub fn disconnect(&mut self, receipt: Option<&str>) -> Result<(), StompError> {
        let frame = self.session.disconnect(receipt)?;
        self.write(&frame)?;
        if let Some(receipt) = receipt.filter(|r| !r.is_empty()) {
            self.wait_for_receipt(receipt, self.receipt_timeout)?;
        }
        self.close();
        Ok(())
    }

    /// Drop the connection without the DISCONNECT handshake. Subscriptions
    /// are kept for replay iff the session was flagged as failed.
    pub fn close(&mut self) {
        self.drop_transport(!self.session.is_failed());
    }

    // -----------------------------------------------------------------------
    // Verbs
    // -----------------------------------------------------------------------

    pub fn send(
        &mut self,
        destination: &str,
        body: Vec<u8>,
        headers: Option<&Headers>,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        let frame = self.session.send(destination, body, headers, receipt)?;
        self.write(&frame)
    }

    /// Subscribe; keep the returned token to match MESSAGE frames and to
    /// unsubscribe.
    pub fn subscribe(
        &mut self,
        destination: &str,
        headers: &Headers,
        receipt: Option<&str>,
    ) -> Result<SubscriptionToken, StompError> {
        let (frame, token) = self.session.subscribe(destination, headers, receipt, ())?;
        self.write(&frame)?;
        Ok(token)
    }

    pub fn unsubscribe(
        &mut self,
        token: &SubscriptionToken,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        let frame = self.session.unsubscribe(token, receipt)?;
        self.write(&frame)
    }

    pub fn ack(&mut self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        let out = self.session.ack(frame, receipt)?;
        self.write(&out)
    }

    pub fn nack(&mut self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        let out = self.session.nack(frame, receipt)?;
        self.write(&out)
    }

    pub fn begin(&mut self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        let frame = self.session.begin(transaction, receipt)?;
        self.write(&frame)
    }

    pub fn abort(&mut self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        let frame = self.session.abort(transaction, receipt)?;
        self.write(&frame)
    }

    pub fn commit(&mut self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        let frame = self.session.commit(transaction, receipt)?;
        self.write(&frame)
    }

    /// Scoped transaction: BEGIN now, COMMIT on [`Transaction::commit`],
    /// ABORT when the guard is dropped uncommitted.
    pub fn transaction(
        &mut self,
        id: &str,
        receipt: Option<&str>,
    ) -> Result<Transaction<'_, F>, StompError> {
        self.begin(id, receipt)?;
        Ok(Transaction {
            client: self,
            id: id.to_owned(),
            done: false,
        })
    }

    /// Send a client-to-server heart-beat.
    pub fn beat(&mut self) -> Result<(), StompError> {
        let beat = self.session.beat()?;
        let transport = self.transport()?;
        transport.send_transmission(&beat)?;
        self.session.sent();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Whether a transmission is available within `timeout`.
    pub fn can_read(&mut self, timeout: Option<Duration>) -> Result<bool, StompError> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        self.transport()?.can_read(timeout)
    }

    /// Block until the next transmission arrives. Session bookkeeping for
    /// MESSAGE and RECEIPT frames is applied before the transmission is
    /// returned; an unexpected close tears the transport down (keeping
    /// subscriptions for replay).
    pub fn receive_frame(&mut self) -> Result<Transmission, StompError> {
        if let Some(pending) = self.pending.pop_front() {
            return Ok(pending);
        }
        let transmission = match self.transport()?.receive() {
            Ok(transmission) => transmission,
            Err(e) => {
                self.session.flag_failure();
                self.drop_transport(false);
                return Err(e);
            }
        };
        self.session.received();
        if let Transmission::Frame(frame) = &transmission {
            self.bookkeep(frame)?;
        }
        Ok(transmission)
    }

    /// Block until the RECEIPT confirming `receipt` arrives; transmissions
    /// received in between stay queued for [`Client::receive_frame`].
    pub fn wait_for_receipt(
        &mut self,
        receipt: &str,
        timeout: Option<Duration>,
    ) -> Result<(), StompError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StompError::Cancelled(format!(
                            "Receipt did not arrive on time: {receipt} [timeout={timeout:?}]"
                        )));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !self.can_read(remaining)? {
                continue;
            }
            // Take directly from the transport: the pending queue only holds
            // transmissions that were already inspected here.
            let transmission = match self.transport()?.receive() {
                Ok(transmission) => transmission,
                Err(e) => {
                    self.session.flag_failure();
                    self.drop_transport(false);
                    return Err(e);
                }
            };
            self.session.received();
            if let Transmission::Frame(frame) = &transmission {
                self.bookkeep(frame)?;
                if frame.command == command::RECEIPT
                    && frame.header(stomp_protocol::spec::header::RECEIPT_ID) == Some(receipt)
                {
                    return Ok(());
                }
            }
            self.pending.push_back(transmission);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn open_transport(
        &mut self,
        connect_timeout: Option<Duration>,
    ) -> Result<FrameTransport<F::Stream>, StompError> {
        loop {
            let (broker, delay) = self.failover.next()?;
            if !delay.is_zero() {
                info!(delay_ms = delay.as_millis() as u64, "delaying connect attempt");
                std::thread::sleep(delay);
            }
            info!(broker = %broker, "connecting");
            match self.factory.open(&broker, connect_timeout) {
                Ok(stream) => {
                    return Ok(FrameTransport::new(
                        stream,
                        self.config.version,
                        broker.to_string(),
                    ));
                }
                Err(e) => {
                    warn!(broker = %broker, error = %e, "could not connect");
                }
            }
        }
    }

    /// Send CONNECT and wait for the validated CONNECTED reply.
    fn negotiate(&mut self, options: &ConnectOptions, host: &str) -> Result<(), StompError> {
        let frame = self.session.connect(
            self.config.login.as_deref(),
            self.config.passcode.as_deref(),
            options.headers.as_ref(),
            options.versions.as_deref(),
            Some(host),
            options.heart_beats,
        )?;
        self.write(&frame)?;

        let deadline = options.connected_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline || !self.transport()?.can_read(Some(deadline - now))? {
                    return Err(StompError::Cancelled(format!(
                        "STOMP broker did not answer on time [timeout={:?}]",
                        options.connected_timeout
                    )));
                }
            }
            let transmission = self.transport()?.receive()?;
            self.session.received();
            match transmission {
                Transmission::HeartBeat => continue,
                Transmission::Frame(frame) if frame.command == command::CONNECTED => {
                    self.session.on_connected(&frame)?;
                    let version = self.session.version();
                    self.transport()?.set_version(version);
                    return Ok(());
                }
                Transmission::Frame(frame) => {
                    return Err(ProtocolError::UnexpectedCommand {
                        got: frame.command,
                        expected: command::CONNECTED,
                    }
                    .into());
                }
            }
        }
    }

    fn bookkeep(&mut self, frame: &Frame) -> Result<(), StompError> {
        match frame.command.as_str() {
            command::MESSAGE => {
                self.session.on_message(frame)?;
            }
            command::RECEIPT => {
                self.session.on_receipt(frame)?;
            }
            command::ERROR => {
                self.session.on_error(frame)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<(), StompError> {
        debug!(frame = %frame.info(), "sending");
        let transport = self.transport()?;
        match transport.send(frame) {
            Ok(()) => {
                self.session.sent();
                Ok(())
            }
            Err(e) => {
                self.session.flag_failure();
                self.drop_transport(false);
                Err(e)
            }
        }
    }

    fn transport(&mut self) -> Result<&mut FrameTransport<F::Stream>, StompError> {
        self.transport
            .as_mut()
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }

    fn drop_transport(&mut self, flush: bool) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown();
        }
        self.pending.clear();
        if self.session.state() != SessionState::Disconnected {
            self.session.close(flush);
        }
    }

}

// ---------------------------------------------------------------------------
// Transaction guard
// ---------------------------------------------------------------------------

/// Scoped STOMP transaction: COMMIT on success, ABORT on drop.
pub struct Transaction<'a, F: StreamFactory> {
    client: &'a mut Client<F>,
    id: String,
    done: bool,
}

impl<F: StreamFactory> Transaction<'_, F> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send frames inside this transaction.
    pub fn send(
        &mut self,
        destination: &str,
        body: Vec<u8>,
        headers: Option<&Headers>,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        let mut headers = headers.cloned().unwrap_or_default();
        headers.push((
            stomp_protocol::spec::header::TRANSACTION.to_owned(),
            self.id.clone(),
        ));
        self.client.send(destination, body, Some(&headers), receipt)
    }

    /// COMMIT the transaction.
    pub fn commit(mut self, receipt: Option<&str>) -> Result<(), StompError> {
        self.done = true;
        self.client.commit(&self.id, receipt)
    }

    /// ABORT the transaction explicitly (dropping the guard does the same).
    pub fn abort(mut self, receipt: Option<&str>) -> Result<(), StompError> {
        self.done = true;
        self.client.abort(&self.id, receipt)
    }
}

impl<F: StreamFactory> Drop for Transaction<'_, F> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.client.abort(&self.id, None) {
                warn!(transaction = %self.id, error = %e, "abort on drop failed");
            }
        }
    }
}
