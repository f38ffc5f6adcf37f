//! Event-driven client end-to-end suite against the scripted broker.
//!
//! # Scenarios
//! 1. Handshake, subscription, message routing to the handler, auto-ack.
//! 2. Graceful disconnect: drain waits for handlers; a short timeout cancels
//!    them and the `disconnected` future carries the reason.
//! 3. ERROR frames and unexpected drops surface through `disconnected`.
//! 4. Subscription replay after reconnect keeps routing to the same handler.
//! 5. Heart-beats: client beats on send silence, disconnects on server
//!    silence.
//! 6. Receipt waits resolve on RECEIPT and cancel on timeout.
//! 7. Failover exhaustion surfaces `maximum retries reached`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stomp_client::asynchronous::{Client, ClientOptions, ConnectOptions, SubscriptionListener};
use stomp_client::protocol::spec::{command, header};
use stomp_client::{Config, ConnectionError, Headers, SessionState, StompError, Version};
use stomp_test_utils::{Script, ScriptedBroker, error_frame, message_frame, receipt_frame};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn config(broker: &ScriptedBroker, version: Version) -> Config {
    Config::new(broker.uri()).version(version)
}

async fn connect(broker: &ScriptedBroker, version: Version) -> Client {
    connect_with(broker, version, ClientOptions::default(), ConnectOptions::default()).await
}

async fn connect_with(
    broker: &ScriptedBroker,
    version: Version,
    mut options: ClientOptions,
    connect_options: ConnectOptions,
) -> Client {
    options.connected_timeout = Some(Duration::from_secs(2));
    let mut client = Client::with_options(config(broker, version), options).unwrap();
    client.connect(&connect_options).await.unwrap();
    client
}

/// Poll the broker's recording without blocking the runtime (spawned
/// client tasks share this thread).
async fn wait(broker: &ScriptedBroker, predicate: impl Fn(&[stomp_client::Frame]) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if predicate(&broker.recorded()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "broker did not observe the expected frames: {:?} (errors: {:?})",
            broker.recorded_commands(),
            broker.errors()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Message flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routes_messages_to_the_handler_and_acks() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .send_frame(message_frame("/queue/test", Some("sub-1"), "m-1", b"one"))
            .expect(command::ACK)
            .send_frame(message_frame("/queue/test", Some("sub-1"), "m-2", b"two"))
            .expect(command::ACK),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    assert_eq!(client.session_state(), SessionState::Connected);
    assert_eq!(client.session_version(), Version::V1_1);

    let (bodies_tx, mut bodies_rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = SubscriptionListener::new(move |_client, frame| {
        let bodies_tx = bodies_tx.clone();
        async move {
            let _ = bodies_tx.send(frame.body.clone());
            Ok(())
        }
    });
    let headers: Headers = vec![(header::ID.to_owned(), "sub-1".to_owned())];
    client
        .subscribe("/queue/test", headers, None, listener)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), bodies_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), bodies_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, b"one");
    assert_eq!(second, b"two");

    wait(&broker, |frames| {
        frames.iter().filter(|f| f.command == "ACK").count() == 2
    })
    .await;
    // The default ack mode was forced onto the SUBSCRIBE frame.
    let subscribe = broker
        .recorded()
        .into_iter()
        .find(|f| f.command == "SUBSCRIBE")
        .unwrap();
    assert_eq!(subscribe.header(header::ACK), Some("client-individual"));
    assert!(broker.errors().is_empty());
}

// ---------------------------------------------------------------------------
// Graceful disconnect
// ---------------------------------------------------------------------------

async fn graceful_disconnect_fixture(
    handler_sleep: Duration,
) -> (ScriptedBroker, Client, Arc<AtomicUsize>) {
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .send_frame(message_frame("/queue/slow", Some("sub-1"), "m-1", b"work")),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();

    let handler_finished = finished.clone();
    let handler_started = started.clone();
    let listener = SubscriptionListener::new(move |_client, _frame| {
        let started_tx = started_tx.clone();
        let handler_started = handler_started.clone();
        let handler_finished = handler_finished.clone();
        async move {
            handler_started.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            tokio::time::sleep(handler_sleep).await;
            handler_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let headers: Headers = vec![(header::ID.to_owned(), "sub-1".to_owned())];
    client
        .subscribe("/queue/slow", headers, None, listener)
        .await
        .unwrap();

    // The handler must be in flight before the disconnect starts.
    tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .expect("handler should have started")
        .unwrap();
    (broker, client, finished)
}

#[tokio::test]
async fn graceful_disconnect_cancels_handlers_that_overrun_the_timeout() {
    init_logging();
    let (_broker, client, _finished) =
        graceful_disconnect_fixture(Duration::from_millis(500)).await;

    client
        .disconnect(None, None, Some(Duration::from_millis(10)))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    match outcome {
        Err(StompError::Cancelled(reason)) => {
            assert_eq!(reason, "Handlers did not finish in time.");
        }
        other => panic!("expected a cancellation reason, got {other:?}"),
    }
}

#[tokio::test]
async fn graceful_disconnect_waits_for_handlers_within_the_timeout() {
    init_logging();
    let (broker, client, finished) =
        graceful_disconnect_fixture(Duration::from_millis(50)).await;

    client
        .disconnect(None, None, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    wait(&broker, |frames| {
        frames.iter().any(|f| f.command == "DISCONNECT")
    })
    .await;
}

#[tokio::test]
async fn disconnect_with_receipt_waits_for_the_broker() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::DISCONNECT)
            .send_frame(receipt_frame("bye")),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    client.disconnect(Some("bye"), None, None).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert!(broker.errors().is_empty());
}

// ---------------------------------------------------------------------------
// Failure surfaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn an_error_frame_tears_the_connection_down() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1).send_frame(error_frame("queue does not exist")),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    match outcome {
        Err(StompError::Protocol(e)) => {
            assert!(e.to_string().contains("ERROR frame"), "got: {e}");
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn an_unexpected_drop_errs_the_disconnected_future() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1).drop_connection(),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(StompError::Connection(_))));
}

// ---------------------------------------------------------------------------
// Reconnect + replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_reattaches_the_same_handler_after_reconnect() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .drop_connection(),
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .send_frame(message_frame("/queue/test", Some("sub-1"), "m-1", b"again")),
    ])
    .unwrap();

    let mut client = Client::with_options(
        config(&broker, Version::V1_1),
        ClientOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ClientOptions::default()
        },
    )
    .unwrap();
    client.connect(&ConnectOptions::default()).await.unwrap();

    let (bodies_tx, mut bodies_rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = SubscriptionListener::new(move |_client, frame| {
        let bodies_tx = bodies_tx.clone();
        async move {
            let _ = bodies_tx.send(frame.body.clone());
            Ok(())
        }
    });
    let headers: Headers = vec![(header::ID.to_owned(), "sub-1".to_owned())];
    client
        .subscribe("/queue/test", headers, None, listener)
        .await
        .unwrap();

    // The broker drops us right after the subscribe.
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .unwrap();
    assert!(outcome.is_err());
    assert_eq!(client.session_state(), SessionState::Disconnected);

    // Reconnect replays the subscription; the second broker connection
    // delivers straight to the original handler.
    client.connect(&ConnectOptions::default()).await.unwrap();
    let body = tokio::time::timeout(Duration::from_secs(2), bodies_rx.recv())
        .await
        .expect("the replayed subscription should deliver")
        .unwrap();
    assert_eq!(body, b"again");

    let subscribes: Vec<_> = broker
        .recorded()
        .into_iter()
        .filter(|f| f.command == "SUBSCRIBE")
        .collect();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1].header(header::ID), Some("sub-1"));
}

// ---------------------------------------------------------------------------
// Heart-beats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn beats_on_send_silence_and_disconnects_on_server_silence() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect_with_heart_beats(Version::V1_2, (100, 100)),
    ])
    .unwrap();

    let mut client = Client::with_options(
        config(&broker, Version::V1_2),
        ClientOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ClientOptions::default()
        },
    )
    .unwrap();
    client
        .connect(&ConnectOptions {
            heart_beats: Some((100, 100)),
            ..ConnectOptions::default()
        })
        .await
        .unwrap();

    // The broker stays silent: after 2 × the negotiated server period the
    // client gives up.
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.disconnected())
        .await
        .expect("server silence should disconnect");
    assert_eq!(
        outcome,
        Err(StompError::Connection(ConnectionError::HeartBeatTimeout))
    );
    // Meanwhile the client kept its own side alive.
    assert!(
        broker.heart_beats_received() >= 1,
        "client should have sent heart-beats, got {}",
        broker.heart_beats_received()
    );
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_resolves_when_the_receipt_arrives() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SEND)
            .send_frame(receipt_frame("r-1")),
    ])
    .unwrap();

    let client = connect(&broker, Version::V1_1).await;
    client
        .send("/queue/test", b"hello".to_vec(), None, Some("r-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn send_cancels_when_the_receipt_never_arrives() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1).expect(command::SEND),
    ])
    .unwrap();

    let client = connect_with(
        &broker,
        Version::V1_1,
        ClientOptions {
            receipt_timeout: Some(Duration::from_millis(50)),
            ..ClientOptions::default()
        },
        ConnectOptions::default(),
    )
    .await;
    let err = client
        .send("/queue/test", b"hello".to_vec(), None, Some("r-lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Cancelled(_)));
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failover_exhaustion_surfaces_maximum_retries() {
    init_logging();
    let config = Config::new(
        "failover:(tcp://127.0.0.1:1)?startupMaxReconnectAttempts=1,initialReconnectDelay=0,randomize=false",
    );
    let mut client = Client::new(config).unwrap();
    let err = client.connect(&ConnectOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        StompError::Connection(ConnectionError::RetriesExhausted)
    );
}

#[tokio::test]
async fn a_failed_handshake_still_counts_against_the_startup_cap() {
    init_logging();
    // The broker accepts TCP but answers CONNECT with an ERROR frame, so
    // the connect cycle never completes.
    let broker = ScriptedBroker::start(vec![
        Script::new(Version::V1_1)
            .expect(command::CONNECT)
            .send_frame(error_frame("bad credentials")),
    ])
    .unwrap();

    let config = Config::new(format!(
        "failover:(tcp://127.0.0.1:{})?startupMaxReconnectAttempts=0,initialReconnectDelay=0,randomize=false",
        broker.addr().port()
    ))
    .version(Version::V1_1);
    let mut client = Client::with_options(
        config,
        ClientOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let err = client.connect(&ConnectOptions::default()).await.unwrap_err();
    assert!(matches!(err, StompError::Protocol(_)), "got: {err:?}");
    let _ = tokio::time::timeout(Duration::from_secs(2), client.disconnected())
        .await
        .expect("the failed handshake should close the connection");

    // The startup cap was spent on the rejected attempt: a second connect
    // exhausts instead of retrying unbounded.
    let err = client.connect(&ConnectOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        StompError::Connection(ConnectionError::RetriesExhausted)
    );
}
