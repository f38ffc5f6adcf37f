//! Client configuration shared by the blocking and the event-driven client.

use crate::error::ConnectionError;
use crate::failover::FailoverUri;
use crate::spec::Version;

/// Connection settings for a STOMP client.
///
/// The `uri` follows the failover DSL (`failover:(tcp://a:1,tcp://b:2)?..`);
/// a plain `tcp://host:port` is a one-broker failover list. `host` is the
/// value for the CONNECT `host` header; when unset, the clients fall back
/// to the first broker's host from the URI. No hostname lookup is ever
/// performed.
#[derive(Debug, Clone)]
pub struct Config {
    pub uri: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub version: Version,
    pub check: bool,
    pub host: Option<String>,
}

impl Config {
    pub fn new(uri: impl Into<String>) -> Config {
        Config {
            uri: uri.into(),
            login: None,
            passcode: None,
            version: Version::default(),
            check: true,
            host: None,
        }
    }

    pub fn login(mut self, login: impl Into<String>) -> Config {
        self.login = Some(login.into());
        self
    }

    pub fn passcode(mut self, passcode: impl Into<String>) -> Config {
        self.passcode = Some(passcode.into());
        self
    }

    /// Upper bound of the STOMP versions offered to the broker.
    pub fn version(mut self, version: Version) -> Config {
        self.version = version;
        self
    }

    /// Disable session-level validation (raw pass-through).
    pub fn unchecked(mut self) -> Config {
        self.check = false;
        self
    }

    /// Value for the CONNECT `host` header.
    pub fn host(mut self, host: impl Into<String>) -> Config {
        self.host = Some(host.into());
        self
    }

    /// Parse the configured failover URI.
    pub fn failover(&self) -> Result<FailoverUri, ConnectionError> {
        FailoverUri::parse(&self.uri)
    }

    /// The effective CONNECT `host` header value.
    pub fn virtual_host(&self) -> Result<String, ConnectionError> {
        match &self.host {
            Some(host) => Ok(host.clone()),
            None => Ok(self.failover()?.brokers[0].host.clone()),
        }
    }
}
