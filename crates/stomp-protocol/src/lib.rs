//! Wire-level core of the STOMP client suite.
//!
//! Everything here is transport-free: per-version protocol tables
//! ([`spec`]), frame values and serialization ([`frame`]), the incremental
//! stream parser ([`parser`]), stateless command builders ([`commands`]),
//! the session state machine ([`session`]), and the failover reconnect
//! policy ([`failover`]). The blocking and event-driven clients in the
//! sibling crates do the I/O.

pub mod commands;
pub mod config;
pub mod error;
pub mod escape;
pub mod failover;
pub mod frame;
pub mod parser;
pub mod session;
pub mod spec;

pub use commands::{SubscriptionToken, TokenKind};
pub use config::Config;
pub use error::{ConnectionError, FrameError, ProtocolError, StompError};
pub use failover::{Broker, FailoverIter, FailoverUri, Scheme};
pub use frame::{Frame, Headers, Transmission};
pub use parser::Parser;
pub use session::{Session, SessionState, Subscription};
pub use spec::Version;
