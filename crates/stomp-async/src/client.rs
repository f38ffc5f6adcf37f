//! The event-driven STOMP client.
//!
//! [`Client`] is a facade over a per-connection core task (see
//! [`crate::core`]): every verb enqueues an operation and returns a future
//! that resolves when the frame went out and, if a receipt was requested,
//! when the broker's RECEIPT arrived. Listeners and message handlers get a
//! cloneable [`ClientHandle`] with the same verbs, so nothing ever points
//! back at the client itself.
//!
//! Dropping a verb's future is the fire-and-forget form; the operation
//! still executes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared as SharedFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::info;

use stomp_protocol::commands::SubscriptionToken;
use stomp_protocol::config::Config;
use stomp_protocol::error::{ConnectionError, StompError};
use stomp_protocol::frame::{Frame, Headers};
use stomp_protocol::session::{Session, SessionState};
use stomp_protocol::spec::{Version, header};

use crate::codec::ClientCodec;
use crate::connector::{Connector, TcpConnector};
use crate::core::{Core, Op, ReceiptWait, Verb};
use crate::creator::ProtocolCreator;
use crate::inflight::InFlight;
use crate::listener::{
    ConnectListener, Listener, ListenerId, SharedListener, SubscriptionHandle,
    SubscriptionListener,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tolerance thresholds relative to the negotiated heart-beat periods: the
/// client beats after `client × period` of send silence and gives the
/// server `server × period` of receive silence before disconnecting.
#[derive(Debug, Clone, Copy)]
pub struct HeartBeatThresholds {
    pub client: f64,
    pub server: f64,
}

impl Default for HeartBeatThresholds {
    fn default() -> HeartBeatThresholds {
        HeartBeatThresholds {
            client: 0.8,
            server: 2.0,
        }
    }
}

/// Client-wide settings.
#[derive(Clone)]
pub struct ClientOptions {
    /// Bound for the wire-level TCP connect.
    pub connect_timeout: Option<Duration>,
    /// Bound for the wait on the broker's CONNECTED frame.
    pub connected_timeout: Option<Duration>,
    /// Bound for each RECEIPT wait.
    pub receipt_timeout: Option<Duration>,
    pub heart_beat: HeartBeatThresholds,
    pub connector: Arc<dyn Connector>,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            connect_timeout: None,
            connected_timeout: None,
            receipt_timeout: None,
            heart_beat: HeartBeatThresholds::default(),
            connector: Arc::new(TcpConnector),
        }
    }
}

/// Per-attempt connect settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub headers: Option<Headers>,
    pub versions: Option<Vec<Version>>,
    pub heart_beats: Option<(u64, u64)>,
    /// Overrides the CONNECT `host` header for this attempt.
    pub host: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the client facade, its handles, and the core task.
pub(crate) struct Shared {
    pub(crate) session: Mutex<Session<SubscriptionHandle>>,
    pub(crate) listeners: Mutex<Vec<(ListenerId, SharedListener)>>,
    pub(crate) next_listener_id: AtomicU64,
    pub(crate) messages: InFlight,
    pub(crate) receipts: InFlight,
    pub(crate) disconnecting: AtomicBool,
    pub(crate) core_alive: AtomicBool,
    pub(crate) connect_running: AtomicBool,
    pub(crate) disconnect_running: AtomicBool,
}

impl Shared {
    pub(crate) fn allocate_listener_id(&self) -> ListenerId {
        self.next_listener_id.fetch_add(1, Ordering::SeqCst)
    }
}

type Disconnected = SharedFuture<BoxFuture<'static, Result<(), StompError>>>;

// ---------------------------------------------------------------------------
// ClientHandle
// ---------------------------------------------------------------------------

/// Cloneable handle with the client's verbs; handed to listeners and
/// message handlers.
#[derive(Clone)]
pub struct ClientHandle {
    pub(crate) ops: mpsc::UnboundedSender<Op>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) receipt_timeout: Option<Duration>,
}

impl ClientHandle {
    pub async fn send(
        &self,
        destination: &str,
        body: Vec<u8>,
        headers: Option<&Headers>,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        self.verb(Verb::Send {
            destination: destination.to_owned(),
            body,
            headers: headers.cloned(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    pub async fn ack(&self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        self.verb(Verb::Ack {
            frame: frame.clone(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    pub async fn nack(&self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        self.verb(Verb::Nack {
            frame: frame.clone(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    pub async fn begin(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.verb(Verb::Begin {
            transaction: transaction.to_owned(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    pub async fn abort(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.verb(Verb::Abort {
            transaction: transaction.to_owned(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    pub async fn commit(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.verb(Verb::Commit {
            transaction: transaction.to_owned(),
            receipt: receipt.map(str::to_owned),
        })
        .await
    }

    /// Send a raw frame, bypassing the session bookkeeping.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), StompError> {
        let (done, rx) = oneshot::channel();
        self.submit(Op::SendFrame { frame, done })?;
        rx.await.map_err(|_| not_connected())?
    }

    /// Send a client-to-server heart-beat.
    pub async fn beat(&self) -> Result<(), StompError> {
        let (done, rx) = oneshot::channel();
        self.submit(Op::Beat { done })?;
        rx.await.map_err(|_| not_connected())?
    }

    /// Start a graceful disconnect in the background; `failure` becomes the
    /// disconnect reason observed via the client's `disconnected` future.
    pub fn initiate_disconnect(&self, failure: Option<StompError>) {
        let handle = self.clone();
        tokio::spawn(async move {
            let _ = run_disconnect(handle, None, failure, None).await;
        });
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session.lock().unwrap().state()
    }

    pub fn session_version(&self) -> Version {
        self.shared.session.lock().unwrap().version()
    }

    pub(crate) fn messages(&self) -> &InFlight {
        &self.shared.messages
    }

    async fn verb(&self, verb: Verb) -> Result<(), StompError> {
        let (done, rx) = oneshot::channel();
        self.submit(Op::Verb { verb, done })?;
        let wait = rx.await.map_err(|_| not_connected())??;
        self.await_receipt(wait).await
    }

    pub(crate) fn submit(&self, op: Op) -> Result<(), StompError> {
        self.ops.send(op).map_err(|_| not_connected())
    }

    /// Wait for a pending receipt, bounded by the configured
    /// `receipt_timeout`.
    pub(crate) async fn await_receipt(&self, wait: Option<ReceiptWait>) -> Result<(), StompError> {
        let Some(ReceiptWait { id, rx }) = wait else {
            return Ok(());
        };
        let cancelled =
            || StompError::Cancelled("In-flight operation cancelled (connection lost)".to_owned());
        match self.receipt_timeout {
            None => rx.await.unwrap_or_else(|_| Err(cancelled())),
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome.unwrap_or_else(|_| Err(cancelled())),
                Err(_) => {
                    self.shared.receipts.remove(&id);
                    Err(StompError::Cancelled(format!(
                        "Receipt did not arrive on time: {id} [timeout={timeout:?}]"
                    )))
                }
            },
        }
    }
}

fn not_connected() -> StompError {
    ConnectionError::NotConnected.into()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// An event-driven STOMP client over the tokio runtime.
pub struct Client {
    config: Config,
    options: ClientOptions,
    shared: Arc<Shared>,
    creator: ProtocolCreator,
    handle: Option<ClientHandle>,
    disconnected: Option<Disconnected>,
}

impl Client {
    pub fn new(config: Config) -> Result<Client, StompError> {
        Client::with_options(config, ClientOptions::default())
    }

    pub fn with_options(config: Config, options: ClientOptions) -> Result<Client, StompError> {
        let uri = config.failover()?;
        let creator = ProtocolCreator::new(uri, options.connector.clone());
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::new(config.version, config.check)),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            messages: InFlight::new("Handler for message"),
            receipts: InFlight::new("Waiting for receipt"),
            disconnecting: AtomicBool::new(false),
            core_alive: AtomicBool::new(false),
            connect_running: AtomicBool::new(false),
            disconnect_running: AtomicBool::new(false),
        });
        Ok(Client {
            config,
            options,
            shared,
            creator,
            handle: None,
            disconnected: None,
        })
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: impl Listener + Send + 'static) -> ListenerId {
        let id = self.shared.allocate_listener_id();
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(Mutex::new(listener))));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.lock().unwrap().retain(|(i, _)| *i != id);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Establish the STOMP connection: failover across brokers, CONNECT,
    /// wait for the validated CONNECTED frame, replay surviving
    /// subscriptions. Only one connect attempt may be pending at a time.
    pub async fn connect(&mut self, options: &ConnectOptions) -> Result<(), StompError> {
        if self.shared.connect_running.swap(true, Ordering::SeqCst) {
            return Err(StompError::AlreadyRunning("connect"));
        }
        let result = self.do_connect(options).await;
        self.shared.connect_running.store(false, Ordering::SeqCst);
        result
    }

    async fn do_connect(&mut self, options: &ConnectOptions) -> Result<(), StompError> {
        if self.shared.core_alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyConnected.into());
        }

        let (_broker, transport) = self.creator.connect(self.options.connect_timeout).await?;

        let host = match &options.host {
            Some(host) => host.clone(),
            None => self.config.virtual_host()?,
        };
        let connect_frame = self.shared.session.lock().unwrap().connect(
            self.config.login.as_deref(),
            self.config.passcode.as_deref(),
            options.headers.as_ref(),
            options.versions.as_deref(),
            Some(&host),
            options.heart_beats,
        )?;

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, disconnected_rx) = oneshot::channel();
        let handle = ClientHandle {
            ops: ops_tx,
            shared: self.shared.clone(),
            receipt_timeout: self.options.receipt_timeout,
        };

        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.shared.disconnect_running.store(false, Ordering::SeqCst);
        self.shared.core_alive.store(true, Ordering::SeqCst);

        // The connect listener resolves the handshake and swaps itself for
        // the default error policy once connected.
        let (connected_tx, connected_rx) = oneshot::channel();
        let connect_listener_id = self.shared.allocate_listener_id();
        self.shared.listeners.lock().unwrap().push((
            connect_listener_id,
            Arc::new(Mutex::new(ConnectListener::new(connected_tx))),
        ));

        let framed = Framed::new(transport, ClientCodec::new(self.config.version));
        let core = Core::new(
            self.shared.clone(),
            framed,
            ops_rx,
            handle.clone(),
            disconnected_tx,
            self.options.heart_beat,
        );
        tokio::spawn(core.run(connect_frame));

        self.handle = Some(handle.clone());
        self.disconnected = Some(
            async move {
                match disconnected_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ConnectionError::Closed("client task dropped".to_owned()).into()),
                }
            }
            .boxed()
            .shared(),
        );

        let connected = match self.options.connected_timeout {
            None => match connected_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(not_connected()),
            },
            Some(timeout) => match tokio::time::timeout(timeout, connected_rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(not_connected()),
                Err(_) => Err(StompError::Cancelled(format!(
                    "STOMP broker did not answer on time [timeout={timeout:?}]"
                ))),
            },
        };
        if let Err(e) = connected {
            handle.initiate_disconnect(Some(e.clone()));
            return Err(e);
        }
        // Only a validated CONNECTED frame completes the connect cycle; a
        // broker that accepted TCP but failed the handshake keeps counting
        // against the startup attempt cap.
        self.creator.reset();

        let (done, rx) = oneshot::channel();
        handle.submit(Op::Replay { done })?;
        if let Ok(result) = rx.await {
            result?;
        }
        Ok(())
    }

    /// Graceful disconnect: broadcast `on_disconnecting`, drain in-flight
    /// handlers (bounded by `timeout`), send DISCONNECT and wait for its
    /// receipt when one was requested, then close the transport. The
    /// aggregate outcome is observed via [`Client::disconnected`].
    pub async fn disconnect(
        &self,
        receipt: Option<&str>,
        failure: Option<StompError>,
        timeout: Option<Duration>,
    ) -> Result<(), StompError> {
        let handle = self.handle()?;
        run_disconnect(handle, receipt.map(str::to_owned), failure, timeout).await
    }

    /// Resolves when the connection to the broker is gone: `Ok` on a clean
    /// close, `Err` with the first recorded reason otherwise.
    pub async fn disconnected(&self) -> Result<(), StompError> {
        match self.disconnected.clone() {
            Some(disconnected) => disconnected.await,
            None => Err(not_connected()),
        }
    }

    // -----------------------------------------------------------------------
    // Verbs
    // -----------------------------------------------------------------------

    /// A cloneable handle carrying every verb; what listeners and message
    /// handlers use.
    pub fn handle(&self) -> Result<ClientHandle, StompError> {
        self.handle.clone().ok_or_else(not_connected)
    }

    pub async fn send(
        &self,
        destination: &str,
        body: Vec<u8>,
        headers: Option<&Headers>,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        self.handle()?.send(destination, body, headers, receipt).await
    }

    pub async fn ack(&self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        self.handle()?.ack(frame, receipt).await
    }

    pub async fn nack(&self, frame: &Frame, receipt: Option<&str>) -> Result<(), StompError> {
        self.handle()?.nack(frame, receipt).await
    }

    pub async fn begin(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.handle()?.begin(transaction, receipt).await
    }

    pub async fn abort(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.handle()?.abort(transaction, receipt).await
    }

    pub async fn commit(&self, transaction: &str, receipt: Option<&str>) -> Result<(), StompError> {
        self.handle()?.commit(transaction, receipt).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), StompError> {
        self.handle()?.send_frame(frame).await
    }

    pub async fn beat(&self) -> Result<(), StompError> {
        self.handle()?.beat().await
    }

    /// Subscribe with a [`SubscriptionListener`] handling this
    /// subscription's messages. Unless the caller set an `ack` header, the
    /// listener's default mode (`client-individual`) is applied. Returns
    /// the token needed to unsubscribe.
    pub async fn subscribe(
        &self,
        destination: &str,
        headers: Headers,
        receipt: Option<&str>,
        listener: SubscriptionListener,
    ) -> Result<SubscriptionToken, StompError> {
        let handle = self.handle()?;
        let mut headers = headers;
        if !headers.iter().any(|(name, _)| name == header::ACK) {
            headers.push((
                header::ACK.to_owned(),
                SubscriptionListener::DEFAULT_ACK_MODE.to_owned(),
            ));
        }

        let shared_listener: SharedListener = Arc::new(Mutex::new(listener));
        let id = self.shared.allocate_listener_id();
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push((id, shared_listener.clone()));
        let context = SubscriptionHandle {
            id,
            listener: shared_listener,
        };

        let (done, rx) = oneshot::channel();
        let submitted = handle.submit(Op::Subscribe {
            destination: destination.to_owned(),
            headers,
            receipt: receipt.map(str::to_owned),
            context,
            done,
        });
        let result = match submitted {
            Ok(()) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(not_connected()),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok((token, wait)) => {
                handle.await_receipt(wait).await?;
                Ok(token)
            }
            Err(e) => {
                self.remove_listener(id);
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(
        &self,
        token: &SubscriptionToken,
        receipt: Option<&str>,
    ) -> Result<(), StompError> {
        let handle = self.handle()?;
        let (done, rx) = oneshot::channel();
        handle.submit(Op::Unsubscribe {
            token: token.clone(),
            receipt: receipt.map(str::to_owned),
            done,
        })?;
        let wait = rx.await.map_err(|_| not_connected())??;
        handle.await_receipt(wait).await
    }

    // -----------------------------------------------------------------------
    // Session snapshot
    // -----------------------------------------------------------------------

    pub fn session_state(&self) -> SessionState {
        self.shared.session.lock().unwrap().state()
    }

    pub fn session_version(&self) -> Version {
        self.shared.session.lock().unwrap().version()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session.lock().unwrap().id().map(str::to_owned)
    }
}

// ---------------------------------------------------------------------------
// Graceful disconnect
// ---------------------------------------------------------------------------

/// The graceful disconnect protocol. Only one disconnect may run at a time;
/// the flag is cleared by the core when the connection is finally lost.
pub(crate) async fn run_disconnect(
    handle: ClientHandle,
    receipt: Option<String>,
    failure: Option<StompError>,
    timeout: Option<Duration>,
) -> Result<(), StompError> {
    if handle.shared.disconnect_running.swap(true, Ordering::SeqCst) {
        return Err(StompError::AlreadyRunning("disconnect"));
    }

    // 1. Announce; the core flags the session and stops dispatching
    //    messages.
    let (done, rx) = oneshot::channel();
    if handle
        .ops
        .send(Op::StartDisconnect {
            failure,
            timeout,
            done,
        })
        .is_err()
    {
        // Core already gone; nothing to tear down.
        handle.shared.disconnect_running.store(false, Ordering::SeqCst);
        return Ok(());
    }
    let _ = rx.await;

    // 2. Drain the in-flight message handlers.
    if !handle.shared.messages.is_empty() {
        info!(timeout = ?timeout, "waiting for outstanding message handlers to finish");
        let drained = match timeout {
            None => {
                handle.shared.messages.wait_idle().await;
                true
            }
            Some(timeout) => {
                tokio::time::timeout(timeout, handle.shared.messages.wait_idle())
                    .await
                    .is_ok()
            }
        };
        if drained {
            info!("all handlers complete, resuming disconnect");
        } else {
            handle
                .shared
                .messages
                .cancel_all("Going down to disconnect now");
            let _ = handle.ops.send(Op::RecordReason(StompError::Cancelled(
                "Handlers did not finish in time.".to_owned(),
            )));
        }
    }

    // 3. The protocol-level goodbye, while still connected.
    let connected = handle.shared.session.lock().unwrap().state() == SessionState::Connected;
    if connected {
        let (done, rx) = oneshot::channel();
        if handle
            .ops
            .send(Op::EmitDisconnect {
                receipt: receipt.clone(),
                done,
            })
            .is_ok()
        {
            if let Ok(Ok(Some(wait))) = rx.await {
                if let Err(e) = handle.await_receipt(Some(wait)).await {
                    if e.is_cancelled() {
                        let _ = handle.ops.send(Op::RecordReason(StompError::Cancelled(
                            "Receipt for disconnect command did not arrive on time.".to_owned(),
                        )));
                    }
                }
            }
        }
    }

    // 4. Drop the transport; `on_connection_lost` fires and the
    //    `disconnected` future resolves.
    let _ = handle.ops.send(Op::CloseTransport);
    Ok(())
}
