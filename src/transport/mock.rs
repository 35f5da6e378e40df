//! Mock transport for unit tests and dry runs: an in-process loopback broker.
//!
//! Every `MockBroker` is an isolated bus; sessions opened through the same
//! broker (or its clones) see each other's publishes. Faults are injected via
//! [`MockFaults`] and the broker exposes enough bookkeeping for tests to check
//! session lifecycles.

use super::config::split_endpoint;
use super::{
    ConnectOptions, Connector, MessageHandler, Qos, Session, TransportError, TransportMessage,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type SharedHandler = Arc<dyn Fn(TransportMessage) + Send + Sync + 'static>;

pub const CORRUPT_PAYLOAD: &[u8] = b"not-a-timestamp";

#[derive(Clone, Debug, Default)]
pub struct MockFaults {
    /// Identities whose connection attempts are refused
    pub refuse_connect: Vec<String>,
    /// Reject every SUBSCRIBE
    pub reject_subscribe: bool,
    /// Fail the publish with this broker-wide sequence number (0-based)
    pub fail_publish_at: Option<u64>,
    /// Identities whose close reports an error (the session is still torn down)
    pub fail_close: Vec<String>,
    /// Replace the payload of every k-th publish with garbage
    pub corrupt_every: Option<u64>,
    /// Per-publish delivery delays, applied cyclically; empty = synchronous delivery
    pub delivery_delays: Vec<Duration>,
    /// This publish (broker-wide sequence number) never completes
    pub stall_publish_at: Option<u64>,
    /// Every subscription is dropped when this publish arrives, as if the broker lost its session state
    pub drop_subscriptions_at: Option<u64>,
}

struct Subscriber {
    session: u64,
    handler: SharedHandler,
}

#[derive(Default)]
struct BrokerState {
    faults: MockFaults,
    next_session: u64,
    live: BTreeMap<u64, String>,
    subs: HashMap<String, Vec<Subscriber>>,
    connect_attempts: HashMap<String, u32>,
    closed: Vec<String>,
    published: u64,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: MockFaults) -> Self {
        let broker = Self::default();
        broker.set_faults(faults);
        broker
    }

    pub fn set_faults(&self, faults: MockFaults) {
        self.lock().faults = faults;
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// Identities of currently open sessions, in open order.
    pub fn live_sessions(&self) -> Vec<String> {
        self.lock().live.values().cloned().collect()
    }

    /// Identities in the order their sessions were closed (failed closes included).
    pub fn close_order(&self) -> Vec<String> {
        self.lock().closed.clone()
    }

    pub fn connect_attempts(&self, identity: &str) -> u32 {
        self.lock()
            .connect_attempts
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn published(&self) -> u64 {
        self.lock().published
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().subs.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Deliver a message from outside any session (a "foreign" publisher).
    /// Returns the number of handlers reached.
    pub fn inject(&self, topic: &str, payload: Bytes) -> usize {
        let handlers = handlers_for(&self.lock(), topic);
        for h in &handlers {
            h(TransportMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
        handlers.len()
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn handlers_for(state: &BrokerState, topic: &str) -> Vec<SharedHandler> {
    state
        .subs
        .get(topic)
        .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl Connector for MockBroker {
    async fn open(
        &self,
        endpoint: &str,
        identity: &str,
        _opts: &ConnectOptions,
    ) -> Result<Box<dyn Session>, TransportError> {
        split_endpoint(endpoint)?;
        let mut state = self.lock();
        *state
            .connect_attempts
            .entry(identity.to_string())
            .or_insert(0) += 1;
        if state.faults.refuse_connect.iter().any(|id| id == identity) {
            return Err(TransportError::Connect(format!(
                "connection refused for '{}'",
                identity
            )));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.live.insert(id, identity.to_string());
        Ok(Box::new(MockSession {
            id,
            identity: identity.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    id: u64,
    identity: String,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn publish(&self, topic: &str, _qos: Qos, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (handlers, payload, delay, stall) = {
            let mut state = lock_state(&self.state);
            let seq = state.published;
            state.published += 1;
            if state.faults.fail_publish_at == Some(seq) {
                return Err(TransportError::Publish(format!(
                    "injected failure at publish {}",
                    seq
                )));
            }
            if state.faults.drop_subscriptions_at == Some(seq) {
                state.subs.clear();
            }
            let payload = match state.faults.corrupt_every {
                Some(k) if k > 0 && (seq + 1) % k == 0 => Bytes::from_static(CORRUPT_PAYLOAD),
                _ => payload,
            };
            let delays = &state.faults.delivery_delays;
            let delay = if delays.is_empty() {
                Duration::ZERO
            } else {
                delays[(seq % delays.len() as u64) as usize]
            };
            let stall = state.faults.stall_publish_at == Some(seq);
            (handlers_for(&state, topic), payload, delay, stall)
        };
        if stall {
            std::future::pending::<()>().await;
        }

        for h in handlers {
            let msg = TransportMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if delay.is_zero() {
                h(msg);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    h(msg);
                });
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: Qos,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state);
        if state.faults.reject_subscribe {
            return Err(TransportError::Subscribe(format!(
                "broker rejected subscription to '{}'",
                topic
            )));
        }
        let subs = state.subs.entry(topic.to_string()).or_default();
        subs.retain(|s| s.session != self.id);
        subs.push(Subscriber {
            session: self.id,
            handler: Arc::from(handler),
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state);
        if let Some(subs) = state.subs.get_mut(topic) {
            subs.retain(|s| s.session != self.id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock_state(&self.state);
        state.live.remove(&self.id);
        for subs in state.subs.values_mut() {
            subs.retain(|s| s.session != self.id);
        }
        state.closed.push(self.identity.clone());
        if state.faults.fail_close.iter().any(|id| id == &self.identity) {
            return Err(TransportError::Close(format!(
                "injected close failure for '{}'",
                self.identity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn pub_sub_mock_smoke() {
        let broker = MockBroker::new();
        let opts = ConnectOptions::default();
        let sub = broker.open("mock:1883", "t-sub", &opts).await.expect("open sub");
        let publisher = broker.open("mock:1883", "t-pub", &opts).await.expect("open pub");

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        sub.subscribe(
            "k1",
            Qos::AtMostOnce,
            Box::new(move |_m: TransportMessage| {
                r2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("subscribe");
        publisher
            .publish("k1", Qos::AtMostOnce, Bytes::from_static(b"hello"))
            .await
            .expect("publish");
        publisher
            .publish("other", Qos::AtMostOnce, Bytes::from_static(b"ignored"))
            .await
            .expect("publish");
        assert_eq!(received.load(Ordering::SeqCst), 1);

        sub.unsubscribe("k1").await.expect("unsubscribe");
        publisher
            .publish("k1", Qos::AtMostOnce, Bytes::from_static(b"late"))
            .await
            .expect("publish");
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_session_is_removed_and_rejects_publish() {
        let broker = MockBroker::new();
        let s = broker
            .open("mock:1883", "c-pub", &ConnectOptions::default())
            .await
            .expect("open");
        assert_eq!(broker.live_sessions(), vec!["c-pub".to_string()]);
        s.close().await.expect("close");
        assert!(broker.live_sessions().is_empty());
        assert!(matches!(
            s.publish("t", Qos::AtMostOnce, Bytes::new()).await,
            Err(TransportError::Disconnected)
        ));
        // second close is a no-op
        s.close().await.expect("close twice");
        assert_eq!(broker.close_order(), vec!["c-pub".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_every_replaces_payloads() {
        let broker = MockBroker::with_faults(MockFaults {
            corrupt_every: Some(2),
            ..Default::default()
        });
        let opts = ConnectOptions::default();
        let s = broker.open("mock:1883", "x", &opts).await.expect("open");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.subscribe(
            "t",
            Qos::AtLeastOnce,
            Box::new(move |m: TransportMessage| seen2.lock().unwrap().push(m.payload)),
        )
        .await
        .expect("subscribe");
        for _ in 0..4 {
            s.publish("t", Qos::AtLeastOnce, Bytes::from_static(b"1"))
                .await
                .expect("publish");
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].as_ref(), b"1");
        assert_eq!(seen[1].as_ref(), CORRUPT_PAYLOAD);
        assert_eq!(seen[2].as_ref(), b"1");
        assert_eq!(seen[3].as_ref(), CORRUPT_PAYLOAD);
    }
}
