//! STOMP client suite: wire protocol core, a blocking client and an
//! event-driven client for the tokio runtime.
//!
//! The umbrella crate re-exports the member crates:
//! - [`protocol`] — frames, parser, commands, session state machine,
//!   failover policy
//! - [`sync`] — the blocking client
//! - [`asynchronous`] — the event-driven client and its listeners

pub use stomp_async as asynchronous;
pub use stomp_protocol as protocol;
pub use stomp_sync as sync;

pub use stomp_protocol::{
    Config, ConnectionError, Frame, FrameError, Headers, Parser, ProtocolError, Session,
    SessionState, StompError, SubscriptionToken, Transmission, Version,
};
