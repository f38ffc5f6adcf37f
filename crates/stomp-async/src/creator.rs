//! Failover-driven connection establishment.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use stomp_protocol::error::StompError;
use stomp_protocol::failover::{Broker, FailoverIter, FailoverUri};

use crate::connector::{BoxedTransport, Connector};

/// Walks the failover iterator until a broker accepts the connection,
/// sleeping the policy's back-off delay between attempts. Exhaustion
/// surfaces the iterator's `maximum retries reached` error.
///
/// A reachable socket is not yet a successful connect: the caller must
/// invoke [`ProtocolCreator::reset`] once the STOMP handshake completes, so
/// a broker that accepts TCP but rejects CONNECT still counts against the
/// startup attempt cap.
pub struct ProtocolCreator {
    failover: FailoverIter,
    connector: Arc<dyn Connector>,
}

impl ProtocolCreator {
    pub fn new(uri: FailoverUri, connector: Arc<dyn Connector>) -> ProtocolCreator {
        ProtocolCreator {
            failover: FailoverIter::new(uri),
            connector,
        }
    }

    /// Connect to the next reachable broker.
    pub async fn connect(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(Broker, BoxedTransport), StompError> {
        loop {
            let (broker, delay) = self.failover.next()?;
            if !delay.is_zero() {
                info!(delay_ms = delay.as_millis() as u64, "delaying connect attempt");
                tokio::time::sleep(delay).await;
            }
            info!(broker = %broker, "connecting");
            match self.connector.connect(broker.clone(), timeout).await {
                Ok(transport) => return Ok((broker, transport)),
                Err(e) => {
                    warn!(broker = %broker, error = %e, "could not connect");
                }
            }
        }
    }

    /// Rearm the failover iterator after a validated CONNECTED frame.
    pub fn reset(&mut self) {
        self.failover.reset();
    }
}
