//! Scripted in-process broker for driving both clients in tests.
//!
//! [`ScriptedBroker`] binds an ephemeral TCP port and plays one
//! [`Script`] per accepted connection: expect a frame, send a frame or raw
//! bytes, delay, or drop the connection. Everything the broker parses is
//! recorded for assertions. Runs on plain `std::net` + threads so the same
//! stub serves the blocking client and the tokio client without nesting
//! runtimes.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use stomp_protocol::frame::{Frame, Transmission};
use stomp_protocol::parser::Parser;
use stomp_protocol::spec::{Version, command, header};

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

pub enum Step {
    /// Read transmissions (recording them, counting heart-beats) until the
    /// next frame; it must carry this command.
    ExpectFrame(&'static str),
    SendFrame(Frame),
    SendBytes(Vec<u8>),
    Delay(Duration),
    /// Close the connection immediately (simulates a broker crash).
    DropConnection,
}

/// One connection's worth of broker behavior. After the last step the
/// broker keeps draining (and recording) until the client closes.
pub struct Script {
    version: Version,
    steps: Vec<Step>,
}

impl Script {
    pub fn new(version: Version) -> Script {
        Script {
            version,
            steps: Vec::new(),
        }
    }

    /// The common prologue: expect CONNECT, reply CONNECTED.
    pub fn accept_connect(version: Version) -> Script {
        Script::new(version)
            .expect(command::CONNECT)
            .send_frame(connected_frame(version, None))
    }

    /// Like [`Script::accept_connect`] but advertising a server heart-beat
    /// proposal.
    pub fn accept_connect_with_heart_beats(version: Version, heart_beats: (u64, u64)) -> Script {
        Script::new(version)
            .expect(command::CONNECT)
            .send_frame(connected_frame(version, Some(heart_beats)))
    }

    pub fn expect(mut self, command: &'static str) -> Script {
        self.steps.push(Step::ExpectFrame(command));
        self
    }

    pub fn send_frame(mut self, frame: Frame) -> Script {
        self.steps.push(Step::SendFrame(frame));
        self
    }

    pub fn send_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Script {
        self.steps.push(Step::SendBytes(bytes.into()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Script {
        self.steps.push(Step::Delay(delay));
        self
    }

    pub fn drop_connection(mut self) -> Script {
        self.steps.push(Step::DropConnection);
        self
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

pub fn connected_frame(version: Version, heart_beats: Option<(u64, u64)>) -> Frame {
    let mut headers = vec![
        (header::VERSION.to_owned(), version.to_string()),
        (header::SESSION.to_owned(), "session-scripted".to_owned()),
        (header::SERVER.to_owned(), "scripted/0.1".to_owned()),
    ];
    if let Some((client, server)) = heart_beats {
        headers.push((header::HEART_BEAT.to_owned(), format!("{client},{server}")));
    }
    let mut frame = Frame::new(command::CONNECTED, headers, Vec::new());
    frame.version = version;
    frame
}

pub fn message_frame(
    destination: &str,
    subscription: Option<&str>,
    message_id: &str,
    body: &[u8],
) -> Frame {
    let mut headers = vec![
        (header::DESTINATION.to_owned(), destination.to_owned()),
        (header::MESSAGE_ID.to_owned(), message_id.to_owned()),
    ];
    if let Some(subscription) = subscription {
        headers.push((header::SUBSCRIPTION.to_owned(), subscription.to_owned()));
    }
    Frame::new(command::MESSAGE, headers, body.to_vec())
}

pub fn receipt_frame(receipt_id: &str) -> Frame {
    Frame::new(
        command::RECEIPT,
        vec![(header::RECEIPT_ID.to_owned(), receipt_id.to_owned())],
        Vec::new(),
    )
}

pub fn error_frame(message: &str) -> Frame {
    Frame::new(
        command::ERROR,
        vec![("message".to_owned(), message.to_owned())],
        message.as_bytes().to_vec(),
    )
}

// ---------------------------------------------------------------------------
// ScriptedBroker
// ---------------------------------------------------------------------------

/// A broker stub on an ephemeral port playing one script per accepted
/// connection.
pub struct ScriptedBroker {
    addr: SocketAddr,
    recorded: Arc<Mutex<Vec<Frame>>>,
    heart_beats: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBroker {
    pub fn start(scripts: Vec<Script>) -> std::io::Result<ScriptedBroker> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let heart_beats = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));

        {
            let recorded = recorded.clone();
            let heart_beats = heart_beats.clone();
            let errors = errors.clone();
            thread::spawn(move || {
                for script in scripts {
                    let Ok((stream, _)) = listener.accept() else {
                        return;
                    };
                    let mut connection = Connection {
                        stream,
                        parser: Parser::new(script.version),
                        recorded: recorded.clone(),
                        heart_beats: heart_beats.clone(),
                        errors: errors.clone(),
                    };
                    connection.run(script);
                }
            });
        }

        Ok(ScriptedBroker {
            addr,
            recorded,
            heart_beats,
            errors,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A `tcp://` broker uri for client configs.
    pub fn uri(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.addr.port())
    }

    /// Every frame the broker has parsed so far.
    pub fn recorded(&self) -> Vec<Frame> {
        self.recorded.lock().unwrap().clone()
    }

    /// Commands of the recorded frames, in arrival order.
    pub fn recorded_commands(&self) -> Vec<String> {
        self.recorded().iter().map(|f| f.command.clone()).collect()
    }

    /// How many bare heart-beats arrived.
    pub fn heart_beats_received(&self) -> usize {
        self.heart_beats.load(Ordering::SeqCst)
    }

    /// Script violations (unexpected commands, premature closes).
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Poll until `predicate(recorded frames)` holds or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[Frame]) -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if predicate(&self.recorded()) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct Connection {
    stream: TcpStream,
    parser: Parser,
    recorded: Arc<Mutex<Vec<Frame>>>,
    heart_beats: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Connection {
    fn run(&mut self, script: Script) {
        for step in script.steps {
            match step {
                Step::ExpectFrame(expected) => match self.next_frame() {
                    Some(frame) => {
                        if frame.command != expected {
                            self.errors.lock().unwrap().push(format!(
                                "expected {expected}, got {}",
                                frame.command
                            ));
                            return;
                        }
                    }
                    None => {
                        self.errors
                            .lock()
                            .unwrap()
                            .push(format!("connection closed while expecting {expected}"));
                        return;
                    }
                },
                Step::SendFrame(mut frame) => {
                    frame.version = script.version;
                    let bytes = frame.serialize().expect("scripted frame serializes");
                    if self.stream.write_all(&bytes).is_err() {
                        return;
                    }
                }
                Step::SendBytes(bytes) => {
                    if self.stream.write_all(&bytes).is_err() {
                        return;
                    }
                }
                Step::Delay(delay) => thread::sleep(delay),
                Step::DropConnection => {
                    let _ = self.stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }
        // Script done: keep recording until the client hangs up.
        while self.next_frame().is_some() {}
    }

    /// Read until the next complete frame, recording as it goes. `None` on
    /// EOF or parse failure.
    fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            match self.parser.get() {
                Some(Transmission::Frame(frame)) => {
                    self.recorded.lock().unwrap().push(frame.clone());
                    return Some(frame);
                }
                Some(Transmission::HeartBeat) => {
                    self.heart_beats.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                None => {}
            }
            let n = self.stream.read(&mut buf).ok()?;
            if n == 0 {
                return None;
            }
            if let Err(e) = self.parser.push(&buf[..n]) {
                self.errors
                    .lock()
                    .unwrap()
                    .push(format!("broker parse error: {e}"));
                return None;
            }
        }
    }
}
