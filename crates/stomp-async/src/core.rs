//! The client core task.
//!
//! One task per connection owns the framed transport, the session and the
//! listener dispatch. It multiplexes three event sources:
//! 1. transmissions decoded off the socket
//! 2. operations enqueued by [`ClientHandle`](crate::client::ClientHandle)s
//! 3. the heart-beat deadline
//!
//! Everything that mutates the session happens here, in order, so frames
//! leave in the order of the operations that produced them and incoming
//! frames dispatch in wire order.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use stomp_protocol::commands::SubscriptionToken;
use stomp_protocol::error::{ConnectionError, FrameError, StompError};
use stomp_protocol::frame::{Frame, Headers, Transmission};
use stomp_protocol::session::SessionState;
use stomp_protocol::spec::{Version, command, header};

use crate::client::{ClientHandle, HeartBeatThresholds, Shared};
use crate::codec::ClientCodec;
use crate::connector::BoxedTransport;
use crate::listener::{Listener, ListenerAction, ListenerContext, SubscriptionHandle};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// A pending receipt: the id and the one-shot resolved when the broker's
/// RECEIPT arrives.
pub(crate) struct ReceiptWait {
    pub(crate) id: String,
    pub(crate) rx: oneshot::Receiver<Result<(), StompError>>,
}

pub(crate) enum Verb {
    Send {
        destination: String,
        body: Vec<u8>,
        headers: Option<Headers>,
        receipt: Option<String>,
    },
    Ack {
        frame: Frame,
        receipt: Option<String>,
    },
    Nack {
        frame: Frame,
        receipt: Option<String>,
    },
    Begin {
        transaction: String,
        receipt: Option<String>,
    },
    Abort {
        transaction: String,
        receipt: Option<String>,
    },
    Commit {
        transaction: String,
        receipt: Option<String>,
    },
}

pub(crate) enum Op {
    Verb {
        verb: Verb,
        done: oneshot::Sender<Result<Option<ReceiptWait>, StompError>>,
    },
    SendFrame {
        frame: Frame,
        done: oneshot::Sender<Result<(), StompError>>,
    },
    Beat {
        done: oneshot::Sender<Result<(), StompError>>,
    },
    Subscribe {
        destination: String,
        headers: Headers,
        receipt: Option<String>,
        context: SubscriptionHandle,
        done: oneshot::Sender<Result<(SubscriptionToken, Option<ReceiptWait>), StompError>>,
    },
    Unsubscribe {
        token: SubscriptionToken,
        receipt: Option<String>,
        done: oneshot::Sender<Result<Option<ReceiptWait>, StompError>>,
    },
    Replay {
        done: oneshot::Sender<Result<(), StompError>>,
    },
    StartDisconnect {
        failure: Option<StompError>,
        timeout: Option<Duration>,
        done: oneshot::Sender<()>,
    },
    EmitDisconnect {
        receipt: Option<String>,
        done: oneshot::Sender<Result<Option<ReceiptWait>, StompError>>,
    },
    RecordReason(StompError),
    CloseTransport,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub(crate) struct Core {
    shared: Arc<Shared>,
    framed: Framed<BoxedTransport, ClientCodec>,
    ops: mpsc::UnboundedReceiver<Op>,
    handle: ClientHandle,
    disconnected_tx: Option<oneshot::Sender<Result<(), StompError>>>,
    reason: Option<StompError>,
    thresholds: HeartBeatThresholds,
}

impl Core {
    pub(crate) fn new(
        shared: Arc<Shared>,
        framed: Framed<BoxedTransport, ClientCodec>,
        ops: mpsc::UnboundedReceiver<Op>,
        handle: ClientHandle,
        disconnected_tx: oneshot::Sender<Result<(), StompError>>,
        thresholds: HeartBeatThresholds,
    ) -> Core {
        Core {
            shared,
            framed,
            ops,
            handle,
            disconnected_tx: Some(disconnected_tx),
            reason: None,
            thresholds,
        }
    }

    /// Drive the connection: write the CONNECT frame, then loop until the
    /// transport is gone.
    pub(crate) async fn run(mut self, connect_frame: Frame) {
        if let Err(e) = self.write_frame(connect_frame.clone()).await {
            self.connection_lost(Some(e));
            return;
        }
        self.dispatch(|listener, ctx| listener.on_connect(ctx, &connect_frame));

        loop {
            let beat_at = self.next_beat_deadline();
            tokio::select! {
                item = self.framed.next() => match item {
                    Some(Ok(transmission)) => self.on_transmission(transmission).await,
                    Some(Err(e)) => {
                        // Malformed wire bytes: remember the reason, then run
                        // the orderly teardown. The stream terminates after a
                        // decode error, so the next poll closes us out.
                        self.record_reason(e.clone());
                        self.handle.initiate_disconnect(Some(e));
                    }
                    None => {
                        self.connection_lost(None);
                        return;
                    }
                },
                op = self.ops.recv() => match op {
                    Some(Op::CloseTransport) | None => {
                        let _ = self.framed.close().await;
                        self.connection_lost(None);
                        return;
                    }
                    Some(op) => self.handle_op(op).await,
                },
                () = tokio::time::sleep_until(beat_at.unwrap_or_else(tokio::time::Instant::now)),
                    if beat_at.is_some() => self.heart_beat_tick().await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn on_transmission(&mut self, transmission: Transmission) {
        self.shared.session.lock().unwrap().received();
        debug!(transmission = %transmission.info(), "received");
        self.dispatch(|listener, ctx| listener.on_frame(ctx, &transmission));

        let result = match &transmission {
            Transmission::HeartBeat => Ok(()),
            Transmission::Frame(frame) => match frame.command.as_str() {
                command::CONNECTED => self.on_connected_frame(frame),
                command::MESSAGE => self.on_message_frame(frame).await,
                command::RECEIPT => self.on_receipt_frame(frame),
                command::ERROR => {
                    self.dispatch(|listener, ctx| listener.on_error(ctx, frame));
                    Ok(())
                }
                other => Err(FrameError::InvalidCommand(other.to_owned()).into()),
            },
        };
        if let Err(e) = result {
            // Broken inbound semantics take the connection down.
            self.record_reason(e.clone());
            self.handle.initiate_disconnect(Some(e));
        }
    }

    fn on_connected_frame(&mut self, frame: &Frame) -> Result<(), StompError> {
        let version = {
            let mut session = self.shared.session.lock().unwrap();
            session.on_connected(frame)?;
            info!(
                session = session.id().unwrap_or("-"),
                version = %session.version(),
                "connected to stomp broker"
            );
            session.version()
        };
        self.framed.codec_mut().set_version(version);
        self.dispatch(|listener, ctx| listener.on_connected(ctx, frame));
        Ok(())
    }

    async fn on_message_frame(&mut self, frame: &Frame) -> Result<(), StompError> {
        if self.shared.disconnecting.load(Ordering::SeqCst) {
            // Too late to dispatch: hand the message back to the broker.
            let nack = {
                let mut session = self.shared.session.lock().unwrap();
                if session.version() == Version::V1_0 {
                    None
                } else {
                    session.nack(frame, None).ok()
                }
            };
            if let Some(nack) = nack {
                debug!(frame = %frame.info(), "nacking message received while disconnecting");
                let _ = self.write_frame(nack).await;
            }
            return Ok(());
        }

        let context = {
            let mut session = self.shared.session.lock().unwrap();
            let token = session.on_message(frame)?;
            session.subscription(&token).map(|s| s.context.clone())
        };
        match context {
            Some(context) => {
                self.dispatch(|listener, ctx| listener.on_message(ctx, frame, &context));
            }
            None => {
                // Only reachable with session validation off.
                warn!(frame = %frame.info(), "ignoring message (no subscription context)");
            }
        }
        Ok(())
    }

    fn on_receipt_frame(&mut self, frame: &Frame) -> Result<(), StompError> {
        let id = self.shared.session.lock().unwrap().on_receipt(frame)?;
        self.shared.receipts.complete(&id, Ok(()));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Verb { verb, done } => {
                let result = self.apply_verb(verb).await;
                let _ = done.send(result);
            }
            Op::SendFrame { frame, done } => {
                let _ = done.send(self.write_frame(frame).await);
            }
            Op::Beat { done } => {
                let beat = self.shared.session.lock().unwrap().beat();
                let result = match beat {
                    Ok(beat) => self.write_transmission(beat).await,
                    Err(e) => Err(e.into()),
                };
                let _ = done.send(result);
            }
            Op::Subscribe {
                destination,
                headers,
                receipt,
                context,
                done,
            } => {
                let result = self
                    .apply_subscribe(&destination, headers, receipt.as_deref(), context)
                    .await;
                let _ = done.send(result);
            }
            Op::Unsubscribe {
                token,
                receipt,
                done,
            } => {
                let result = self.apply_unsubscribe(&token, receipt.as_deref()).await;
                let _ = done.send(result);
            }
            Op::Replay { done } => {
                let _ = done.send(self.apply_replay().await);
            }
            Op::StartDisconnect {
                failure,
                timeout,
                done,
            } => {
                if let Some(failure) = &failure {
                    self.record_reason(failure.clone());
                    self.shared.session.lock().unwrap().flag_failure();
                }
                self.shared.disconnecting.store(true, Ordering::SeqCst);
                self.dispatch(|listener, ctx| {
                    listener.on_disconnecting(ctx, failure.as_ref(), timeout);
                });
                let _ = done.send(());
            }
            Op::EmitDisconnect { receipt, done } => {
                let result = self.apply_emit_disconnect(receipt.as_deref()).await;
                let _ = done.send(result);
            }
            Op::RecordReason(reason) => self.record_reason(reason),
            // Handled in the run loop.
            Op::CloseTransport => {}
        }
    }

    async fn apply_verb(&mut self, verb: Verb) -> Result<Option<ReceiptWait>, StompError> {
        let frame = {
            let mut session = self.shared.session.lock().unwrap();
            match verb {
                Verb::Send {
                    destination,
                    body,
                    headers,
                    receipt,
                } => session.send(&destination, body, headers.as_ref(), receipt.as_deref())?,
                Verb::Ack { frame, receipt } => session.ack(&frame, receipt.as_deref())?,
                Verb::Nack { frame, receipt } => session.nack(&frame, receipt.as_deref())?,
                Verb::Begin {
                    transaction,
                    receipt,
                } => session.begin(&transaction, receipt.as_deref())?,
                Verb::Abort {
                    transaction,
                    receipt,
                } => session.abort(&transaction, receipt.as_deref())?,
                Verb::Commit {
                    transaction,
                    receipt,
                } => session.commit(&transaction, receipt.as_deref())?,
            }
        };
        self.send_with_receipt(frame).await
    }

    async fn apply_subscribe(
        &mut self,
        destination: &str,
        headers: Headers,
        receipt: Option<&str>,
        context: SubscriptionHandle,
    ) -> Result<(SubscriptionToken, Option<ReceiptWait>), StompError> {
        let (frame, token) = self.shared.session.lock().unwrap().subscribe(
            destination,
            &headers,
            receipt,
            context.clone(),
        )?;
        self.dispatch(|listener, ctx| listener.on_subscribe(ctx, &frame, &context));
        let wait = self.send_with_receipt(frame).await?;
        Ok((token, wait))
    }

    async fn apply_unsubscribe(
        &mut self,
        token: &SubscriptionToken,
        receipt: Option<&str>,
    ) -> Result<Option<ReceiptWait>, StompError> {
        let (context, frame) = {
            let mut session = self.shared.session.lock().unwrap();
            let context = session.subscription(token).map(|s| s.context.clone());
            let frame = session.unsubscribe(token, receipt)?;
            (context, frame)
        };
        if let Some(context) = context {
            self.dispatch(|listener, ctx| listener.on_unsubscribe(ctx, Some(&frame), &context));
        }
        self.send_with_receipt(frame).await
    }

    /// Re-issue every subscription the session kept across the reconnect,
    /// with its original context.
    async fn apply_replay(&mut self) -> Result<(), StompError> {
        let entries = self.shared.session.lock().unwrap().replay();
        for (destination, headers, receipt, context) in entries {
            info!(destination = %destination, "replaying subscription");
            // The subscription's listener unregistered itself when the
            // connection was lost; re-attach it under its original id.
            {
                let mut listeners = self.shared.listeners.lock().unwrap();
                if !listeners.iter().any(|(id, _)| *id == context.id) {
                    listeners.push((context.id, context.listener.clone()));
                }
            }
            let (frame, _token) = self.shared.session.lock().unwrap().subscribe(
                &destination,
                &headers,
                receipt.as_deref(),
                context.clone(),
            )?;
            self.dispatch(|listener, ctx| listener.on_subscribe(ctx, &frame, &context));
            // Replay receipts are fire-and-forget; the registry entry is
            // cleared when the broker confirms.
            let _ = self.send_with_receipt(frame).await?;
        }
        Ok(())
    }

    async fn apply_emit_disconnect(
        &mut self,
        receipt: Option<&str>,
    ) -> Result<Option<ReceiptWait>, StompError> {
        let frame = self.shared.session.lock().unwrap().disconnect(receipt)?;
        match self.send_with_receipt(frame).await {
            Ok(wait) => Ok(wait),
            Err(e) => {
                self.record_reason(
                    ConnectionError::Closed(format!("could not send DISCONNECT [{e}]")).into(),
                );
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    async fn send_with_receipt(&mut self, frame: Frame) -> Result<Option<ReceiptWait>, StompError> {
        let wait = match frame.header(header::RECEIPT) {
            Some(id) => Some(ReceiptWait {
                id: id.to_owned(),
                rx: self.shared.receipts.insert(id)?,
            }),
            None => None,
        };
        if let Err(e) = self.write_frame(frame).await {
            if let Some(wait) = &wait {
                self.shared.receipts.remove(&wait.id);
            }
            return Err(e);
        }
        Ok(wait)
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), StompError> {
        self.dispatch(|listener, ctx| listener.on_send(ctx, &frame));
        debug!(frame = %frame.info(), "sending");
        self.write_transmission(Transmission::Frame(frame)).await
    }

    async fn write_transmission(&mut self, transmission: Transmission) -> Result<(), StompError> {
        self.framed.send(transmission).await?;
        self.shared.session.lock().unwrap().sent();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Heart-beats
    // -----------------------------------------------------------------------

    fn next_beat_deadline(&self) -> Option<tokio::time::Instant> {
        let session = self.shared.session.lock().unwrap();
        if session.state() != SessionState::Connected {
            return None;
        }
        let mut deadline: Option<std::time::Instant> = None;
        if session.client_heart_beat() > 0 {
            let at = session.last_sent()
                + scale(session.client_heart_beat(), self.thresholds.client);
            deadline = Some(at);
        }
        if session.server_heart_beat() > 0 {
            let at = session.last_received()
                + scale(session.server_heart_beat(), self.thresholds.server);
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        }
        deadline.map(tokio::time::Instant::from_std)
    }

    async fn heart_beat_tick(&mut self) {
        let now = std::time::Instant::now();
        let (client_due, server_due, beat) = {
            let session = self.shared.session.lock().unwrap();
            let client_due = session.client_heart_beat() > 0
                && now
                    >= session.last_sent()
                        + scale(session.client_heart_beat(), self.thresholds.client);
            let server_due = session.server_heart_beat() > 0
                && now
                    >= session.last_received()
                        + scale(session.server_heart_beat(), self.thresholds.server);
            (client_due, server_due, session.beat())
        };
        if server_due {
            warn!("server heart-beat timeout");
            self.handle
                .initiate_disconnect(Some(ConnectionError::HeartBeatTimeout.into()));
            return;
        }
        if client_due {
            if let Ok(beat) = beat {
                debug!("sending heart-beat");
                let _ = self.write_transmission(beat).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn connection_lost(&mut self, error: Option<StompError>) {
        let expected = self.shared.disconnecting.load(Ordering::SeqCst);
        if let Some(e) = error {
            self.record_reason(e);
        } else if !expected {
            self.record_reason(
                ConnectionError::Closed("unexpected connection loss".to_owned()).into(),
            );
        }

        let cancel_reason = "In-flight operation cancelled (connection lost)";
        self.shared.messages.cancel_all(cancel_reason);
        self.shared.receipts.cancel_all(cancel_reason);

        let reason = self.reason.clone();
        // A clean close flushes the subscriptions; a failing one keeps them
        // so the next connect can replay.
        self.shared.session.lock().unwrap().close(reason.is_none());
        self.dispatch(|listener, ctx| listener.on_connection_lost(ctx, reason.as_ref()));

        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.shared.disconnect_running.store(false, Ordering::SeqCst);
        self.shared.core_alive.store(false, Ordering::SeqCst);

        if let Some(tx) = self.disconnected_tx.take() {
            let _ = tx.send(match reason {
                None => Ok(()),
                Some(reason) => Err(reason),
            });
        }
        info!("connection closed");
    }

    /// The first recorded disconnect reason wins.
    fn record_reason(&mut self, reason: StompError) {
        error!(reason = %reason, "disconnect reason");
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }

    // -----------------------------------------------------------------------
    // Listener dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one event to a snapshot of the listeners, in registration
    /// order, then apply the add/remove/swap actions they queued.
    fn dispatch(&mut self, mut event: impl FnMut(&mut (dyn Listener + Send), &mut ListenerContext<'_>)) {
        let snapshot: Vec<_> = self.shared.listeners.lock().unwrap().clone();
        let mut actions = Vec::new();
        for (id, listener) in &snapshot {
            let mut ctx = ListenerContext {
                handle: &self.handle,
                own_id: *id,
                actions: &mut actions,
            };
            let mut guard = listener.lock().unwrap();
            event(&mut *guard, &mut ctx);
        }
        if actions.is_empty() {
            return;
        }
        let mut listeners = self.shared.listeners.lock().unwrap();
        for action in actions {
            match action {
                ListenerAction::Add(listener) => {
                    let id = self.shared.allocate_listener_id();
                    listeners.push((id, listener));
                }
                ListenerAction::Remove(id) => listeners.retain(|(i, _)| *i != id),
                ListenerAction::Replace(id, listener) => {
                    if let Some(entry) = listeners.iter_mut().find(|(i, _)| *i == id) {
                        entry.1 = listener;
                    }
                }
            }
        }
    }
}

fn scale(period_ms: u64, threshold: f64) -> Duration {
    Duration::from_millis((period_ms as f64 * threshold) as u64)
}
