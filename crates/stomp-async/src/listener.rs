//! Listener plug-ins for the event-driven client.
//!
//! Listeners are the extension seam: the client broadcasts every lifecycle
//! event to a snapshot of the registered listeners, in registration order.
//! Callbacks are synchronous and cheap; anything long-running (a message
//! handler) is spawned as a task and tracked in the in-flight registry, so
//! graceful disconnect can wait for it.
//!
//! Listeners never hold a pointer back to the client; the
//! [`ListenerContext`] hands them a cloneable [`ClientHandle`] whose verbs
//! enqueue work into the client's core task, plus an action queue for
//! add/remove/swap of listeners (applied after the event finishes
//! dispatching, so mutation during dispatch is safe).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{error, warn};

use stomp_protocol::error::{ProtocolError, StompError};
use stomp_protocol::frame::{Frame, Headers, Transmission};
use stomp_protocol::spec::{self, header};

use crate::client::ClientHandle;

// ---------------------------------------------------------------------------
// Ids and handles
// ---------------------------------------------------------------------------

pub type ListenerId = u64;

pub type SharedListener = Arc<Mutex<dyn Listener + Send>>;

/// The opaque context a subscription is registered under: the id and handle
/// of the listener that owns it. Kept inside the session registry, it
/// survives an unexpected connection loss so replay can re-attach the same
/// listener.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub id: ListenerId,
    pub listener: SharedListener,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// ListenerContext
// ---------------------------------------------------------------------------

pub(crate) enum ListenerAction {
    Add(SharedListener),
    Remove(ListenerId),
    Replace(ListenerId, SharedListener),
}

/// Per-dispatch context handed to every listener callback.
pub struct ListenerContext<'a> {
    pub(crate) handle: &'a ClientHandle,
    pub(crate) own_id: ListenerId,
    pub(crate) actions: &'a mut Vec<ListenerAction>,
}

impl ListenerContext<'_> {
    /// A cloneable handle for issuing client operations.
    pub fn handle(&self) -> &ClientHandle {
        self.handle
    }

    /// The id under which the listener currently being dispatched is
    /// registered.
    pub fn own_id(&self) -> ListenerId {
        self.own_id
    }

    /// Register another listener once this event finishes dispatching.
    pub fn add_listener(&mut self, listener: impl Listener + Send + 'static) {
        self.actions
            .push(ListenerAction::Add(Arc::new(Mutex::new(listener))));
    }

    /// Unregister the listener being dispatched.
    pub fn remove_self(&mut self) {
        self.actions.push(ListenerAction::Remove(self.own_id));
    }

    /// Swap the listener being dispatched for another one.
    pub fn replace_self(&mut self, listener: impl Listener + Send + 'static) {
        self.actions.push(ListenerAction::Replace(
            self.own_id,
            Arc::new(Mutex::new(listener)),
        ));
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// The fixed callback set of the event-driven client. Every method has a
/// no-op default; implement the ones the plug-in cares about.
#[allow(unused_variables)]
pub trait Listener {
    /// The CONNECT frame went out.
    fn on_connect(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {}

    /// The broker's CONNECTED frame was validated.
    fn on_connected(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {}

    /// Any transmission arrived (fires before the command-specific events).
    fn on_frame(&mut self, ctx: &mut ListenerContext<'_>, transmission: &Transmission) {}

    /// A MESSAGE frame arrived for the subscription identified by `context`.
    fn on_message(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        frame: &Frame,
        context: &SubscriptionHandle,
    ) {
    }

    /// A frame is about to be written.
    fn on_send(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {}

    /// A SUBSCRIBE frame is about to go out for `context`.
    fn on_subscribe(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        frame: &Frame,
        context: &SubscriptionHandle,
    ) {
    }

    /// An UNSUBSCRIBE frame is about to go out for `context`.
    fn on_unsubscribe(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        frame: Option<&Frame>,
        context: &SubscriptionHandle,
    ) {
    }

    /// An ERROR frame arrived.
    fn on_error(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {}

    /// The connection is gone. `reason` is `None` for a clean close.
    fn on_connection_lost(&mut self, ctx: &mut ListenerContext<'_>, reason: Option<&StompError>) {}

    /// A graceful disconnect started.
    fn on_disconnecting(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        failure: Option<&StompError>,
        timeout: Option<Duration>,
    ) {
    }
}

// ---------------------------------------------------------------------------
// ConnectListener
// ---------------------------------------------------------------------------

/// One-shot listener resolving the connect handshake: success on CONNECTED
/// (swapping itself for an [`ErrorListener`]), failure on ERROR or
/// connection loss.
pub(crate) struct ConnectListener {
    waiting: Option<oneshot::Sender<Result<(), StompError>>>,
}

impl ConnectListener {
    pub(crate) fn new(waiting: oneshot::Sender<Result<(), StompError>>) -> ConnectListener {
        ConnectListener {
            waiting: Some(waiting),
        }
    }
}

impl Listener for ConnectListener {
    fn on_connected(&mut self, ctx: &mut ListenerContext<'_>, _frame: &Frame) {
        if let Some(waiting) = self.waiting.take() {
            let _ = waiting.send(Ok(()));
        }
        ctx.replace_self(ErrorListener);
    }

    fn on_error(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {
        if let Some(waiting) = self.waiting.take() {
            let _ = waiting.send(Err(ProtocolError::BrokerError(format!(
                "while trying to connect, received {}",
                frame.info()
            ))
            .into()));
        }
        ctx.remove_self();
    }

    fn on_connection_lost(&mut self, ctx: &mut ListenerContext<'_>, reason: Option<&StompError>) {
        if let Some(waiting) = self.waiting.take() {
            let reason = reason.cloned().unwrap_or_else(|| {
                stomp_protocol::error::ConnectionError::Closed(
                    "connection lost while connecting".to_owned(),
                )
                .into()
            });
            let _ = waiting.send(Err(reason));
        }
        ctx.remove_self();
    }
}

// ---------------------------------------------------------------------------
// ErrorListener
// ---------------------------------------------------------------------------

/// Default post-connect policy: any ERROR frame tears the connection down.
pub struct ErrorListener;

impl Listener for ErrorListener {
    fn on_error(&mut self, ctx: &mut ListenerContext<'_>, frame: &Frame) {
        ctx.handle().initiate_disconnect(Some(
            ProtocolError::BrokerError(format!("received {}", frame.info())).into(),
        ));
    }

    fn on_connection_lost(&mut self, ctx: &mut ListenerContext<'_>, _reason: Option<&StompError>) {
        ctx.remove_self();
    }
}

// ---------------------------------------------------------------------------
// SubscriptionListener
// ---------------------------------------------------------------------------

/// Per-message handler: receives the client handle and the MESSAGE frame.
pub type MessageHandler =
    Arc<dyn Fn(ClientHandle, Frame) -> BoxFuture<'static, Result<(), StompError>> + Send + Sync>;

/// Custom error policy for failed handlers:
/// `(handle, error, frame, error_destination)`.
pub type MessageFailedHandler =
    Arc<dyn Fn(ClientHandle, StompError, Frame, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The event handler corresponding to one STOMP subscription.
///
/// Routes MESSAGE frames of its subscription to the handler, spawning one
/// task per message (registered in the client's in-flight registry so
/// graceful disconnect can drain it). After the handler finishes,
/// successfully or not, the message is acked when `ack` is set and the
/// subscription uses a client ack mode. A failed handler is delegated to
/// the error policy: by default the offending frame is forwarded (with
/// broker-reserved headers stripped) to `error_destination`, or merely
/// logged when none is configured.
pub struct SubscriptionListener {
    handler: MessageHandler,
    ack: bool,
    error_destination: Option<String>,
    on_message_failed: Option<MessageFailedHandler>,
    headers: Option<Headers>,
}

impl SubscriptionListener {
    /// The ack mode forced onto the SUBSCRIBE frame unless the caller set
    /// one: individual acks keep concurrent handlers independent.
    pub const DEFAULT_ACK_MODE: &'static str = spec::ACK_CLIENT_INDIVIDUAL;

    pub fn new<F, Fut>(handler: F) -> SubscriptionListener
    where
        F: Fn(ClientHandle, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StompError>> + Send + 'static,
    {
        SubscriptionListener {
            handler: Arc::new(move |client, frame| {
                let handled: BoxFuture<'static, Result<(), StompError>> =
                    Box::pin(handler(client, frame));
                handled
            }),
            ack: true,
            error_destination: None,
            on_message_failed: None,
            headers: None,
        }
    }

    /// Disable the automatic ACK after the handler completes.
    pub fn manual_ack(mut self) -> SubscriptionListener {
        self.ack = false;
        self
    }

    /// Forward frames whose handler failed to this destination.
    pub fn error_destination(mut self, destination: impl Into<String>) -> SubscriptionListener {
        self.error_destination = Some(destination.into());
        self
    }

    /// Replace the default failed-handler policy.
    pub fn on_message_failed<F, Fut>(mut self, policy: F) -> SubscriptionListener
    where
        F: Fn(ClientHandle, StompError, Frame, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message_failed = Some(Arc::new(move |client, error, frame, destination| {
            let handled: BoxFuture<'static, ()> =
                Box::pin(policy(client, error, frame, destination));
            handled
        }));
        self
    }

    fn ack_mode(&self) -> &str {
        self.headers
            .as_ref()
            .and_then(|headers| {
                headers
                    .iter()
                    .find(|(name, _)| name == header::ACK)
                    .map(|(_, value)| value.as_str())
            })
            .unwrap_or(spec::ACK_AUTO)
    }
}

impl Listener for SubscriptionListener {
    fn on_subscribe(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        frame: &Frame,
        context: &SubscriptionHandle,
    ) {
        if context.id != ctx.own_id() {
            return;
        }
        // Keep the effective SUBSCRIBE headers for the ack-mode decision.
        self.headers = Some(
            frame
                .headers()
                .into_iter()
                .map(|(n, v)| (n.to_owned(), v.to_owned()))
                .collect(),
        );
    }

    fn on_message(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        frame: &Frame,
        context: &SubscriptionHandle,
    ) {
        if context.id != ctx.own_id() {
            return;
        }
        let Some(message_id) = frame.header(header::MESSAGE_ID) else {
            return;
        };
        let registry = ctx.handle().messages().clone();
        let Ok(_completion) = registry.insert(message_id) else {
            warn!(message_id, "message already in flight, ignoring redelivery");
            return;
        };

        let should_ack = self.ack && spec::is_client_ack(self.ack_mode());
        let handler = self.handler.clone();
        let failure_policy = self.on_message_failed.clone();
        let error_destination = self.error_destination.clone();
        let handle = ctx.handle().clone();
        let frame = frame.clone();
        let key = message_id.to_owned();

        tokio::spawn(async move {
            if let Err(e) = handler.as_ref()(handle.clone(), frame.clone()).await {
                match &failure_policy {
                    Some(policy) => {
                        policy.as_ref()(handle.clone(), e, frame.clone(), error_destination).await;
                    }
                    None => {
                        forward_to_error_destination(&handle, e, &frame, error_destination).await;
                    }
                }
            }
            if should_ack {
                if let Err(e) = handle.ack(&frame, None).await {
                    warn!(message_id = %key, error = %e, "could not ack message");
                }
            }
            registry.complete(&key, Ok(()));
        });
    }

    fn on_unsubscribe(
        &mut self,
        ctx: &mut ListenerContext<'_>,
        _frame: Option<&Frame>,
        context: &SubscriptionHandle,
    ) {
        if context.id != ctx.own_id() {
            return;
        }
        self.headers = None;
        ctx.remove_self();
    }

    fn on_connection_lost(&mut self, ctx: &mut ListenerContext<'_>, _reason: Option<&StompError>) {
        self.headers = None;
        ctx.remove_self();
    }
}

/// Default poison-pill policy: forward a reserved-header-filtered copy of
/// the frame to the error destination (when one is configured) so the
/// message is not lost when it gets acked afterwards.
async fn forward_to_error_destination(
    handle: &ClientHandle,
    error: StompError,
    frame: &Frame,
    error_destination: Option<String>,
) {
    error!(frame = %frame.info(), error = %error, "message handler failed");
    let Some(destination) = error_destination else {
        return;
    };
    let copy = frame.forward_copy();
    let headers: Headers = copy
        .headers()
        .into_iter()
        .map(|(n, v)| (n.to_owned(), v.to_owned()))
        .collect();
    if let Err(e) = handle
        .send(&destination, copy.body.clone(), Some(&headers), None)
        .await
    {
        error!(destination = %destination, error = %e, "could not forward to error destination");
    }
}
