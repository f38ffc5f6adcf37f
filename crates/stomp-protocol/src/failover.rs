//! Failover URI and reconnect iterator.
//!
//! A failover URI encodes an ordered broker list plus reconnect policy:
//!
//! ```text
//! failover:(tcp://remote1:61615,tcp://localhost:61616)?initialReconnectDelay=100,randomize=false
//! ```
//!
//! The plain forms `failover:tcp://host:port` and `tcp://host:port` are
//! accepted as one-broker lists. The iterator is pure: it yields
//! `(broker, delay)` pairs and the consumer performs the actual sleeping
//! and connecting.

use std::str::FromStr;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::ConnectionError;

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// One broker endpoint from a failover list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl FromStr for Broker {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConnectionError::Uri(s.to_owned());
        let (scheme, rest) = s.split_once("://").ok_or_else(bad)?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "ssl" => Scheme::Ssl,
            _ => return Err(bad()),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Broker {
            scheme,
            host: host.to_owned(),
            port,
        })
    }
}

// ---------------------------------------------------------------------------
// FailoverUri
// ---------------------------------------------------------------------------

/// Parsed failover descriptor: broker list + reconnect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverUri {
    pub brokers: Vec<Broker>,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    pub startup_max_reconnect_attempts: i32,
    pub max_reconnect_attempts: i32,
    pub randomize: bool,
    pub priority_backup: bool,
}

impl FailoverUri {
    pub fn parse(uri: &str) -> Result<FailoverUri, ConnectionError> {
        let (brokers, options) = match uri.strip_prefix("failover:") {
            Some(rest) => match rest.strip_prefix('(') {
                Some(rest) => {
                    let (brokers, options) = rest
                        .split_once(')')
                        .ok_or_else(|| ConnectionError::Uri(uri.to_owned()))?;
                    let options = match options {
                        "" => None,
                        options => Some(options.strip_prefix('?').ok_or_else(|| {
                            ConnectionError::Uri(uri.to_owned())
                        })?),
                    };
                    (brokers, options)
                }
                None => match rest.split_once('?') {
                    Some((brokers, options)) => (brokers, Some(options)),
                    None => (rest, None),
                },
            },
            // A bare broker uri is a one-element failover list.
            None => (uri, None),
        };

        let brokers = brokers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Broker::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if brokers.is_empty() {
            return Err(ConnectionError::Uri(uri.to_owned()));
        }

        let mut parsed = FailoverUri {
            brokers,
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(30_000),
            back_off_multiplier: 2.0,
            use_exponential_back_off: true,
            startup_max_reconnect_attempts: 0,
            max_reconnect_attempts: -1,
            randomize: true,
            priority_backup: false,
        };
        for option in options.into_iter().flat_map(|o| o.split(',')) {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| ConnectionError::Uri(format!("malformed option: {option}")))?;
            parsed.apply_option(key, value)?;
        }
        Ok(parsed)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConnectionError> {
        let bad = || ConnectionError::Uri(format!("invalid value for {key}: {value}"));
        match key {
            "initialReconnectDelay" => {
                self.initial_reconnect_delay =
                    Duration::from_millis(value.parse().map_err(|_| bad())?);
            }
            "maxReconnectDelay" => {
                self.max_reconnect_delay =
                    Duration::from_millis(value.parse().map_err(|_| bad())?);
            }
            "backOffMultiplier" => {
                self.back_off_multiplier = value.parse().map_err(|_| bad())?;
            }
            "useExponentialBackOff" => {
                self.use_exponential_back_off = parse_bool(value).ok_or_else(bad)?;
            }
            "startupMaxReconnectAttempts" => {
                self.startup_max_reconnect_attempts = value.parse().map_err(|_| bad())?;
            }
            "maxReconnectAttempts" => {
                self.max_reconnect_attempts = value.parse().map_err(|_| bad())?;
            }
            "randomize" => {
                self.randomize = parse_bool(value).ok_or_else(bad)?;
            }
            "priorityBackup" => {
                self.priority_backup = parse_bool(value).ok_or_else(bad)?;
            }
            _ => {
                return Err(ConnectionError::Uri(format!(
                    "unknown failover option: {key}"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for FailoverUri {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailoverUri::parse(s)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// FailoverIter
// ---------------------------------------------------------------------------

/// Yields `(broker, delay)` connect attempts according to the reconnect
/// policy, until the round cap is exhausted.
///
/// Call [`FailoverIter::reset`] after a successful connect: the attempt
/// counter and back-off restart, and later cycles are capped by
/// `maxReconnectAttempts` instead of `startupMaxReconnectAttempts`.
#[derive(Debug)]
pub struct FailoverIter {
    uri: FailoverUri,
    order: Vec<usize>,
    cursor: usize,
    rounds_started: u32,
    delay: Duration,
    connected_before: bool,
}

impl FailoverIter {
    pub fn new(uri: FailoverUri) -> FailoverIter {
        FailoverIter {
            order: Vec::new(),
            cursor: 0,
            rounds_started: 0,
            delay: Duration::ZERO,
            connected_before: false,
            uri,
        }
    }

    pub fn uri(&self) -> &FailoverUri {
        &self.uri
    }

    /// The next attempt: which broker to try and how long to sleep first.
    pub fn next(&mut self) -> Result<(Broker, Duration), ConnectionError> {
        if self.cursor >= self.order.len() {
            self.start_round()?;
        }
        let broker = self.uri.brokers[self.order[self.cursor]].clone();
        self.cursor += 1;
        Ok((broker, self.delay))
    }

    /// Rearm after a successful connect.
    pub fn reset(&mut self) {
        self.order.clear();
        self.cursor = 0;
        self.rounds_started = 0;
        self.delay = Duration::ZERO;
        self.connected_before = true;
    }

    fn start_round(&mut self) -> Result<(), ConnectionError> {
        let cap = if self.connected_before {
            self.uri.max_reconnect_attempts
        } else {
            self.uri.startup_max_reconnect_attempts
        };
        // A cap of N allows N + 1 full rounds; negative means unbounded.
        if cap >= 0 && self.rounds_started > cap as u32 {
            return Err(ConnectionError::RetriesExhausted);
        }

        self.delay = self.round_delay();
        self.order = (0..self.uri.brokers.len()).collect();
        if self.uri.randomize {
            self.order.shuffle(&mut rand::rng());
        }
        if self.uri.priority_backup {
            if let Some(position) = self.order.iter().position(|&i| i == 0) {
                self.order.remove(position);
                self.order.insert(0, 0);
            }
        }
        self.cursor = 0;
        self.rounds_started += 1;
        Ok(())
    }

    fn round_delay(&self) -> Duration {
        if self.rounds_started == 0 {
            return Duration::ZERO;
        }
        let initial = self.uri.initial_reconnect_delay;
        if !self.uri.use_exponential_back_off {
            return initial.min(self.uri.max_reconnect_delay);
        }
        let factor = self
            .uri
            .back_off_multiplier
            .powi(self.rounds_started as i32 - 1);
        let millis = (initial.as_millis() as f64 * factor)
            .min(self.uri.max_reconnect_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}
