//! Transport abstraction: session traits, QoS, connect options and the builder.

pub mod config;
#[cfg(any(test, feature = "transport-mock"))]
pub mod mock;
#[cfg(feature = "transport-mqtt")]
pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Engine {
    Mqtt,
    #[cfg(any(test, feature = "transport-mock"))]
    Mock,
}

/// MQTT delivery guarantee for a publish or subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(TransportError::Other(format!("invalid QoS level {}", other))),
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Keep-alive interval announced in CONNECT (seconds)
    pub keep_alive_secs: u64,
    /// Ask the broker to discard any previous session state
    pub clean_start: bool,
    /// How long to wait for CONNACK / SUBACK before giving up (ms)
    pub connect_timeout_ms: u64,
    /// Enable connection retry with backoff (default: false)
    pub retry_enabled: bool,
    /// Maximum number of retry attempts (default: 3)
    pub retry_count: u32,
    /// Initial delay between retries in milliseconds (default: 1000)
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds (default: 30000)
    pub retry_max_delay_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive_secs: 5,
            clean_start: true,
            connect_timeout_ms: 10_000,
            retry_enabled: false,
            retry_count: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl ConnectOptions {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("endpoint: {0}")]
    Endpoint(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("close: {0}")]
    Close(String),
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("other: {0}")]
    Other(String),
}

impl TransportError {
    /// Worth another connection attempt: refused, timed out or dropped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout | Self::Disconnected)
    }
}

/// A message delivered to a subscription.
#[derive(Clone, Debug)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Delivery callback. Invoked from the session's own event-loop context, so it
/// must not block and must not assume ordering with the caller of `subscribe`.
pub type MessageHandler = Box<dyn Fn(TransportMessage) + Send + Sync + 'static>;

/// One live broker connection.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Client identity presented to the broker.
    fn identity(&self) -> &str;
    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), TransportError>;
    // Replaces any handler previously installed for the same topic. Returns once
    // the broker has acknowledged the subscription.
    async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        handler: MessageHandler,
    ) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens sessions against broker endpoints (`host:port`).
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        identity: &str,
        opts: &ConnectOptions,
    ) -> Result<Box<dyn Session>, TransportError>;
}

pub struct TransportBuilder;

impl TransportBuilder {
    pub fn connector(engine: Engine) -> Result<Arc<dyn Connector>, TransportError> {
        match engine {
            Engine::Mqtt => {
                #[cfg(feature = "transport-mqtt")]
                {
                    Ok(Arc::new(crate::transport::mqtt::MqttConnector::new()))
                }
                #[cfg(not(feature = "transport-mqtt"))]
                {
                    Err(TransportError::Other("mqtt feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "transport-mock"))]
            Engine::Mock => Ok(Arc::new(crate::transport::mock::MockBroker::new())),
        }
    }

    /// Open with optional retry logic based on ConnectOptions settings.
    /// If retry_enabled is false, this is a single `open` attempt.
    /// If retry_enabled is true, retries up to retry_count times with exponential backoff.
    /// Errors that are not recoverable (a malformed endpoint) are returned immediately.
    pub async fn open_with_retry(
        connector: &dyn Connector,
        endpoint: &str,
        identity: &str,
        opts: &ConnectOptions,
    ) -> Result<Box<dyn Session>, TransportError> {
        if !opts.retry_enabled {
            return connector.open(endpoint, identity, opts).await;
        }

        let max_attempts = opts.retry_count.max(1);
        let initial_delay = Duration::from_millis(opts.retry_delay_ms.max(100));
        let max_delay = Duration::from_millis(
            opts.retry_max_delay_ms
                .max(initial_delay.as_millis() as u64),
        );
        let mut current_delay = initial_delay;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match connector.open(endpoint, identity, opts).await {
                Ok(session) => {
                    if attempt > 1 {
                        tracing::info!(%endpoint, %identity, attempt, "Connection succeeded after retry");
                    }
                    return Ok(session);
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Connection attempt {}/{} to {} failed: {}. Retrying in {:?}...",
                        attempt,
                        max_attempts,
                        endpoint,
                        e,
                        current_delay
                    );
                    last_error = Some(e);

                    if attempt < max_attempts {
                        tokio::time::sleep(current_delay).await;
                        current_delay = std::cmp::min(current_delay * 2, max_delay);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::Connect("Connection failed after all retry attempts".into())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBroker, MockFaults};

    #[test]
    fn qos_levels_round_trip_through_u8() {
        for level in 0u8..=2 {
            let qos = Qos::try_from(level).expect("valid level");
            assert_eq!(qos.level(), level);
        }
        assert!(Qos::try_from(3).is_err());
    }

    #[tokio::test]
    async fn open_with_retry_gives_up_after_retry_count() {
        let broker = MockBroker::with_faults(MockFaults {
            refuse_connect: vec!["flaky-pub".into()],
            ..Default::default()
        });
        let opts = ConnectOptions {
            retry_enabled: true,
            retry_count: 2,
            retry_delay_ms: 100,
            retry_max_delay_ms: 100,
            ..Default::default()
        };
        let res = TransportBuilder::open_with_retry(&broker, "mock:1883", "flaky-pub", &opts).await;
        assert!(matches!(res, Err(TransportError::Connect(_))));
        assert_eq!(broker.connect_attempts("flaky-pub"), 2);
    }

    /// Fails every attempt with the error produced by `make`.
    struct FailingConnector {
        make: fn() -> TransportError,
        attempts: std::sync::atomic::AtomicU32,
    }

    impl FailingConnector {
        fn new(make: fn() -> TransportError) -> Self {
            Self {
                make,
                attempts: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Connector for FailingConnector {
        async fn open(
            &self,
            _endpoint: &str,
            _identity: &str,
            _opts: &ConnectOptions,
        ) -> Result<Box<dyn Session>, TransportError> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err((self.make)())
        }
    }

    fn retrying(count: u32) -> ConnectOptions {
        ConnectOptions {
            retry_enabled: true,
            retry_count: count,
            retry_delay_ms: 100,
            retry_max_delay_ms: 400,
            ..Default::default()
        }
    }

    #[test]
    fn only_transient_errors_are_recoverable() {
        assert!(TransportError::Connect("refused".into()).is_recoverable());
        assert!(TransportError::Timeout.is_recoverable());
        assert!(TransportError::Disconnected.is_recoverable());
        assert!(!TransportError::Endpoint("bad".into()).is_recoverable());
        assert!(!TransportError::Subscribe("rejected".into()).is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn open_with_retry_retries_timeouts() {
        let connector = FailingConnector::new(|| TransportError::Timeout);
        let res =
            TransportBuilder::open_with_retry(&connector, "h:1883", "slow-pub", &retrying(4)).await;
        assert!(matches!(res, Err(TransportError::Timeout)));
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn open_with_retry_stops_on_bad_endpoint() {
        let connector = FailingConnector::new(|| TransportError::Endpoint("bad port".into()));
        let res =
            TransportBuilder::open_with_retry(&connector, "h:x", "bad-pub", &retrying(4)).await;
        assert!(matches!(res, Err(TransportError::Endpoint(_))));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn open_without_retry_is_a_single_attempt() {
        let broker = MockBroker::with_faults(MockFaults {
            refuse_connect: vec!["once-pub".into()],
            ..Default::default()
        });
        let res = TransportBuilder::open_with_retry(
            &broker,
            "mock:1883",
            "once-pub",
            &ConnectOptions::default(),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(broker.connect_attempts("once-pub"), 1);
    }
}
