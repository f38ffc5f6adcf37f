//! Event-driven STOMP client on the tokio runtime.
//!
//! The client runs one core task per connection which owns the socket, the
//! codec and the session; the public [`Client`] and its cloneable
//! [`ClientHandle`]s enqueue operations into it. Listeners
//! ([`listener::Listener`]) observe every lifecycle event;
//! [`listener::SubscriptionListener`] routes MESSAGE frames to per-message
//! handler tasks tracked for graceful disconnect.

pub mod client;
pub mod codec;
pub mod connector;
pub mod core;
pub mod creator;
pub mod inflight;
pub mod listener;

pub use client::{Client, ClientHandle, ClientOptions, ConnectOptions, HeartBeatThresholds};
pub use codec::ClientCodec;
pub use connector::{BoxedTransport, Connector, TcpConnector, Transport};
pub use creator::ProtocolCreator;
pub use inflight::InFlight;
pub use listener::{
    ErrorListener, Listener, ListenerContext, ListenerId, SubscriptionHandle,
    SubscriptionListener,
};
