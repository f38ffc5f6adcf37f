//! Blocking client end-to-end suite against the scripted broker.
//!
//! Each test scripts one (or more) broker connections over a real socket:
//! connect handshake, verbs with receipts, message flow with acks, scoped
//! transactions, and subscription replay after an unexpected drop.

use std::time::Duration;

use stomp_client::protocol::spec::{command, header};
use stomp_client::sync::{Client, ConnectOptions};
use stomp_client::{Config, Headers, StompError, Transmission, Version};
use stomp_test_utils::{Script, ScriptedBroker, message_frame, receipt_frame};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn connect_client(broker: &ScriptedBroker, version: Version) -> Client {
    let config = Config::new(broker.uri()).version(version);
    let mut client = Client::new(config).unwrap();
    client
        .connect(&ConnectOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ConnectOptions::default()
        })
        .unwrap();
    client
}

fn wait(broker: &ScriptedBroker, predicate: impl Fn(&[stomp_client::Frame]) -> bool) {
    assert!(
        broker.wait_for(Duration::from_secs(2), predicate),
        "broker did not observe the expected frames: {:?} (errors: {:?})",
        broker.recorded_commands(),
        broker.errors()
    );
}

// ---------------------------------------------------------------------------
// Connect / send / receipt
// ---------------------------------------------------------------------------

#[test]
fn connects_sends_and_waits_for_the_receipt() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_2)
            .expect(command::SEND)
            .send_frame(receipt_frame("r-1")),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_2);
    assert_eq!(client.session().version(), Version::V1_2);
    assert_eq!(client.session().id(), Some("session-scripted"));

    client
        .send("/queue/test", b"hello".to_vec(), None, Some("r-1"))
        .unwrap();
    client
        .wait_for_receipt("r-1", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(client.session().pending_receipts().count(), 0);

    wait(&broker, |frames| frames.len() == 2);
    let recorded = broker.recorded();
    assert_eq!(recorded[0].command, "CONNECT");
    assert_eq!(recorded[0].header(header::ACCEPT_VERSION), Some("1.0,1.1,1.2"));
    assert_eq!(recorded[0].header(header::HOST), Some("127.0.0.1"));
    assert_eq!(recorded[1].command, "SEND");
    assert_eq!(recorded[1].body, b"hello");
    assert!(broker.errors().is_empty());
}

#[test]
fn receipt_wait_times_out_when_the_broker_stays_silent() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_0).expect(command::SEND),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_0);
    client
        .send("/queue/test", Vec::new(), None, Some("r-unanswered"))
        .unwrap();
    let err = client
        .wait_for_receipt("r-unanswered", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, StompError::Cancelled(_)));
}

// ---------------------------------------------------------------------------
// Subscribe / message / ack
// ---------------------------------------------------------------------------

#[test]
fn routes_a_message_and_acks_it() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .send_frame(message_frame("/queue/test", Some("sub-1"), "m-1", b"payload"))
            .expect(command::ACK),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_1);
    let headers: Headers = vec![
        (header::ID.to_owned(), "sub-1".to_owned()),
        (header::ACK.to_owned(), "client-individual".to_owned()),
    ];
    let token = client.subscribe("/queue/test", &headers, None).unwrap();

    assert!(client.can_read(Some(Duration::from_secs(2))).unwrap());
    let message = match client.receive_frame().unwrap() {
        Transmission::Frame(frame) => frame,
        Transmission::HeartBeat => panic!("expected a MESSAGE frame"),
    };
    assert_eq!(message.command, "MESSAGE");
    assert_eq!(message.body, b"payload");

    client.ack(&message, None).unwrap();
    client.unsubscribe(&token, None).unwrap();

    wait(&broker, |frames| {
        frames.iter().filter(|f| f.command == "ACK").count() == 1
    });
    let ack = broker
        .recorded()
        .into_iter()
        .find(|f| f.command == "ACK")
        .unwrap();
    assert_eq!(ack.header(header::SUBSCRIPTION), Some("sub-1"));
    assert_eq!(ack.header(header::MESSAGE_ID), Some("m-1"));
    assert!(broker.errors().is_empty());
}

#[test]
fn v1_0_subscriptions_match_messages_by_destination() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_0)
            .expect(command::SUBSCRIBE)
            .send_frame(message_frame("/queue/test", None, "m-1", b"old school")),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_0);
    client
        .subscribe("/queue/test", &Headers::new(), None)
        .unwrap();
    let message = client.receive_frame().unwrap().frame().unwrap();
    assert_eq!(message.body, b"old school");
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn transaction_guard_commits_on_success_and_aborts_on_drop() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::BEGIN)
            .expect(command::SEND)
            .expect(command::COMMIT)
            .expect(command::BEGIN)
            .expect(command::ABORT),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_1);

    let mut tx = client.transaction("tx-1", None).unwrap();
    tx.send("/queue/test", b"in tx".to_vec(), None, None).unwrap();
    tx.commit(None).unwrap();

    {
        let _abandoned = client.transaction("tx-2", None).unwrap();
        // Dropped uncommitted: the guard aborts.
    }

    wait(&broker, |frames| {
        frames.iter().any(|f| f.command == "ABORT")
    });
    let commands = broker.recorded_commands();
    assert_eq!(
        commands,
        vec!["CONNECT", "BEGIN", "SEND", "COMMIT", "BEGIN", "ABORT"]
    );
    let in_tx = &broker.recorded()[2];
    assert_eq!(in_tx.header(header::TRANSACTION), Some("tx-1"));
    assert!(broker.errors().is_empty());
}

// ---------------------------------------------------------------------------
// Reconnect + replay
// ---------------------------------------------------------------------------

#[test]
fn replays_subscriptions_after_an_unexpected_drop() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .drop_connection(),
        Script::accept_connect(Version::V1_1).expect(command::SUBSCRIBE),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_1);
    let headers: Headers = vec![(header::ID.to_owned(), "sub-1".to_owned())];
    client.subscribe("/queue/test", &headers, None).unwrap();

    // The broker drops us; the next read surfaces the loss and keeps the
    // subscription for replay.
    let err = client.receive_frame().unwrap_err();
    assert!(matches!(err, StompError::Connection(_)));
    assert_eq!(client.session().subscription_count(), 1);

    client
        .connect(&ConnectOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ConnectOptions::default()
        })
        .unwrap();

    wait(&broker, |frames| {
        frames.iter().filter(|f| f.command == "SUBSCRIBE").count() == 2
    });
    let subscribes: Vec<_> = broker
        .recorded()
        .into_iter()
        .filter(|f| f.command == "SUBSCRIBE")
        .collect();
    assert_eq!(subscribes[1].header(header::DESTINATION), Some("/queue/test"));
    assert_eq!(subscribes[1].header(header::ID), Some("sub-1"));
    assert!(broker.errors().is_empty());
}

#[test]
fn clean_disconnect_does_not_replay() {
    init_logging();
    let broker = ScriptedBroker::start(vec![
        Script::accept_connect(Version::V1_1)
            .expect(command::SUBSCRIBE)
            .expect(command::DISCONNECT),
        Script::accept_connect(Version::V1_1),
    ])
    .unwrap();

    let mut client = connect_client(&broker, Version::V1_1);
    let headers: Headers = vec![(header::ID.to_owned(), "sub-1".to_owned())];
    client.subscribe("/queue/test", &headers, None).unwrap();
    client.disconnect(None).unwrap();
    assert_eq!(client.session().subscription_count(), 0);

    client
        .connect(&ConnectOptions {
            connected_timeout: Some(Duration::from_secs(2)),
            ..ConnectOptions::default()
        })
        .unwrap();

    wait(&broker, |frames| {
        frames.iter().filter(|f| f.command == "CONNECT").count() == 2
    });
    assert_eq!(
        broker
            .recorded_commands()
            .iter()
            .filter(|c| *c == "SUBSCRIBE")
            .count(),
        1
    );
}

// ---------------------------------------------------------------------------
// can_read
// ---------------------------------------------------------------------------

#[test]
fn can_read_times_out_on_a_silent_connection() {
    init_logging();
    let broker =
        ScriptedBroker::start(vec![Script::accept_connect(Version::V1_0)]).unwrap();

    let mut client = connect_client(&broker, Version::V1_0);
    assert!(!client.can_read(Some(Duration::from_millis(50))).unwrap());
}
