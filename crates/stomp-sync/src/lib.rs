//! Blocking STOMP client.
//!
//! [`Client`] drives a [`FrameTransport`] (socket + incremental parser) and
//! a session state machine with blocking semantics: `receive_frame` blocks
//! until one transmission is parsed, `can_read` polls with a timeout, and
//! reconnects walk the failover iterator with real sleeps.

pub mod client;
pub mod transport;

pub use client::{Client, ConnectOptions, StreamFactory, TcpFactory, Transaction};
pub use transport::{FrameTransport, SyncStream};
