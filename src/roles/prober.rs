//! Round-trip prober: one measurement batch against an open session pair.
//!
//! The publisher sends `count` payloads, each carrying its own send time in
//! nanoseconds, to a single topic the subscriber listens on. The delivery
//! handler runs on the subscriber's event-loop context; it only timestamps,
//! parses and forwards an [`Observation`] over a bounded channel. The driving
//! task owns the sample vector and the completion count, consuming
//! observations while the publish loop is still running.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::clock::{now_unix_ns, round_trip};
use crate::metrics::stats::{LatencySummary, StatsError};
use crate::payload::{encode_timestamp, parse_timestamp};
use crate::session::SessionPair;
use crate::transport::{Qos, Session, TransportError, TransportMessage};

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub topic: String,
    pub qos: Qos,
    /// Expected samples; also the number of publishes
    pub count: u64,
    /// Delay after every publish
    pub pace: Duration,
    /// Bound on each publish call, and on the wait for outstanding deliveries
    /// once the last publish went out
    pub timeout: Option<Duration>,
    /// Dropped deliveries tolerated before the batch fails
    pub max_malformed: Option<u64>,
}

impl BatchConfig {
    fn queue_capacity(&self) -> usize {
        self.count.clamp(64, 65_536) as usize
    }
}

#[derive(Clone, Debug)]
pub struct BatchReport {
    pub qos: Qos,
    pub summary: LatencySummary,
    /// Deliveries dropped because their payload was not a usable timestamp
    pub malformed: u64,
    pub elapsed: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("session pair is not open")]
    NotOpen,
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] TransportError),
    #[error("publish {seq} failed: {source}")]
    Publish {
        seq: u64,
        #[source]
        source: TransportError,
    },
    #[error("timed out after {waited:?} with {received}/{expected} samples ({malformed} dropped)")]
    Timeout {
        received: u64,
        expected: u64,
        malformed: u64,
        waited: Duration,
    },
    #[error("{malformed} malformed deliveries exceed the limit of {limit}")]
    TooManyMalformed { malformed: u64, limit: u64 },
    #[error("delivery stream ended with {received}/{expected} samples")]
    DeliveryClosed { received: u64, expected: u64 },
    #[error(transparent)]
    Stats(#[from] StatsError),
}

impl ProbeError {
    /// Broker operation failures leave the sessions in an unknown state.
    fn tears_down_pair(&self) -> bool {
        matches!(self, ProbeError::Subscribe(_) | ProbeError::Publish { .. })
    }
}

/// What the delivery handler hands to the driving task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Sample(Duration),
    Dropped,
}

fn observe(msg: &TransportMessage, received_ns: i64) -> Observation {
    match parse_timestamp(&msg.payload) {
        Ok(sent_ns) => match round_trip(sent_ns, received_ns) {
            Some(d) => Observation::Sample(d),
            None => {
                warn!(topic = %msg.topic, sent_ns, received_ns, "Timestamp is ahead of the receive clock; dropping sample");
                Observation::Dropped
            }
        },
        Err(e) => {
            warn!(topic = %msg.topic, error = %e, "Unable to parse timestamp; dropping sample");
            Observation::Dropped
        }
    }
}

struct Collector {
    expected: u64,
    samples: Vec<Duration>,
    malformed: u64,
    max_malformed: Option<u64>,
}

impl Collector {
    fn new(cfg: &BatchConfig) -> Self {
        Self {
            expected: cfg.count,
            samples: Vec::with_capacity(cfg.count.min(1 << 20) as usize),
            malformed: 0,
            max_malformed: cfg.max_malformed,
        }
    }

    fn received(&self) -> u64 {
        self.samples.len() as u64
    }

    fn is_complete(&self) -> bool {
        self.received() >= self.expected
    }

    fn accept(&mut self, obs: Observation) -> Result<(), ProbeError> {
        match obs {
            Observation::Sample(d) => self.samples.push(d),
            Observation::Dropped => {
                self.malformed += 1;
                if let Some(limit) = self.max_malformed {
                    if self.malformed > limit {
                        return Err(ProbeError::TooManyMalformed {
                            malformed: self.malformed,
                            limit,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run one batch. On a subscribe or publish failure the pair is closed before
/// the error is returned.
pub async fn run_batch(
    pair: &mut SessionPair,
    cfg: &BatchConfig,
) -> Result<BatchReport, ProbeError> {
    let target = pair.target().name.clone();
    let outcome = match pair.sessions() {
        Some((publisher, subscriber)) => probe(publisher, subscriber, cfg).await,
        None => Err(ProbeError::NotOpen),
    };

    match outcome {
        Ok(report) => {
            info!(
                target_name = %target,
                pub_addr = %pair.target().pub_addr,
                sub_addr = %pair.target().sub_addr,
                qos = cfg.qos.level(),
                samples = report.summary.count,
                dropped = report.malformed,
                min_ms = format!("{:.3}", report.summary.min.as_secs_f64() * 1e3),
                max_ms = format!("{:.3}", report.summary.max.as_secs_f64() * 1e3),
                avg_ms = format!("{:.3}", report.summary.mean.as_secs_f64() * 1e3),
                "Batch complete"
            );
            Ok(report)
        }
        Err(e) => {
            if e.tears_down_pair() {
                if let Err(close_err) = pair.close().await {
                    warn!(target_name = %target, error = %close_err, "Teardown after failed batch");
                }
            }
            Err(e)
        }
    }
}

async fn probe(
    publisher: &dyn Session,
    subscriber: &dyn Session,
    cfg: &BatchConfig,
) -> Result<BatchReport, ProbeError> {
    let started = Instant::now();
    let (tx, rx) = flume::bounded::<Observation>(cfg.queue_capacity());

    let topic = cfg.topic.clone();
    subscriber
        .subscribe(
            &cfg.topic,
            cfg.qos,
            Box::new(move |msg: TransportMessage| {
                let received_ns = now_unix_ns();
                if msg.topic != topic {
                    return;
                }
                match tx.try_send(observe(&msg, received_ns)) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        warn!(topic = %msg.topic, "Observation queue full; delivery lost")
                    }
                    // Batch already finished; late duplicate or straggler.
                    Err(flume::TrySendError::Disconnected(_)) => {}
                }
            }),
        )
        .await
        .map_err(ProbeError::Subscribe)?;
    debug!(topic = %cfg.topic, qos = cfg.qos.level(), count = cfg.count, "Subscribed, publishing");

    let collected = collect(publisher, &rx, cfg).await;

    if let Err(e) = subscriber.unsubscribe(&cfg.topic).await {
        debug!(topic = %cfg.topic, error = %e, "Unsubscribe after batch failed");
    }

    let collector = collected?;
    let summary = LatencySummary::from_samples(&collector.samples)?;
    Ok(BatchReport {
        qos: cfg.qos,
        summary,
        malformed: collector.malformed,
        elapsed: started.elapsed(),
    })
}

async fn publish_all(publisher: &dyn Session, cfg: &BatchConfig) -> Result<(), ProbeError> {
    for seq in 0..cfg.count {
        let payload = encode_timestamp(now_unix_ns());
        let publish = publisher.publish(&cfg.topic, cfg.qos, payload);
        let res = match cfg.timeout {
            Some(t) => tokio::time::timeout(t, publish)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => publish.await,
        };
        res.map_err(|source| ProbeError::Publish { seq, source })?;
        trace!(seq, "Published");
        tokio::time::sleep(cfg.pace).await;
    }
    Ok(())
}

/// Drive the publish loop and drain observations until every publish went out
/// and `count` samples arrived, or the post-publish deadline passes.
async fn collect(
    publisher: &dyn Session,
    rx: &flume::Receiver<Observation>,
    cfg: &BatchConfig,
) -> Result<Collector, ProbeError> {
    let mut collector = Collector::new(cfg);
    let publishing = publish_all(publisher, cfg);
    tokio::pin!(publishing);
    let mut published = false;
    let mut deadline: Option<(Instant, Duration)> = None;

    loop {
        if published && collector.is_complete() {
            return Ok(collector);
        }
        tokio::select! {
            res = &mut publishing, if !published => {
                res?;
                published = true;
                deadline = cfg.timeout.map(|t| (Instant::now() + t, t));
                debug!(
                    received = collector.received(),
                    expected = collector.expected,
                    "All messages published, awaiting deliveries"
                );
            }
            obs = rx.recv_async(), if !collector.is_complete() => match obs {
                Ok(obs) => collector.accept(obs)?,
                Err(_) => {
                    return Err(ProbeError::DeliveryClosed {
                        received: collector.received(),
                        expected: collector.expected,
                    })
                }
            },
            _ = tokio::time::sleep_until(deadline.map(|(at, _)| at).unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                return Err(ProbeError::Timeout {
                    received: collector.received(),
                    expected: collector.expected,
                    malformed: collector.malformed,
                    waited: deadline.map(|(_, t)| t).unwrap_or_default(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::transport::mock::{MockBroker, MockFaults};
    use crate::transport::ConnectOptions;
    use bytes::Bytes;
    use std::sync::Arc;

    fn batch(count: u64) -> BatchConfig {
        BatchConfig {
            topic: "probe/test".into(),
            qos: Qos::AtMostOnce,
            count,
            pace: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
            max_malformed: None,
        }
    }

    async fn open_pair(broker: &MockBroker) -> SessionPair {
        let mut pair = SessionPair::new(
            Target::new("loop", "mock:1883", "mock:1883"),
            Arc::new(broker.clone()),
            ConnectOptions::default(),
        );
        pair.open().await.expect("open");
        pair
    }

    fn msg(payload: &'static [u8]) -> TransportMessage {
        TransportMessage {
            topic: "t".into(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn observe_turns_timestamps_into_round_trips() {
        assert_eq!(
            observe(&msg(b"1000"), 1_250),
            Observation::Sample(Duration::from_nanos(250))
        );
        assert_eq!(observe(&msg(b"garbage"), 1_250), Observation::Dropped);
        assert_eq!(observe(&msg(b"2000"), 1_250), Observation::Dropped);
    }

    #[test]
    fn collector_enforces_drop_limit() {
        let mut c = Collector::new(&BatchConfig {
            max_malformed: Some(1),
            ..batch(2)
        });
        c.accept(Observation::Dropped).unwrap();
        c.accept(Observation::Sample(Duration::from_millis(1))).unwrap();
        assert!(!c.is_complete());
        assert!(matches!(
            c.accept(Observation::Dropped),
            Err(ProbeError::TooManyMalformed {
                malformed: 2,
                limit: 1
            })
        ));
    }

    #[tokio::test]
    async fn completes_after_exactly_count_deliveries_in_any_order() {
        // Later publishes are delivered first.
        let broker = MockBroker::with_faults(MockFaults {
            delivery_delays: [40u64, 30, 20, 10, 0]
                .iter()
                .map(|&ms| Duration::from_millis(ms))
                .collect(),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;

        let report = run_batch(&mut pair, &batch(5)).await.expect("batch");
        assert_eq!(report.summary.count, 5);
        assert_eq!(report.malformed, 0);
        assert_eq!(broker.published(), 5);
        assert!(report.summary.min <= report.summary.p95);
        assert!(report.summary.p99 <= report.summary.max);
        // the 40 ms delay is part of the slowest round trip
        assert!(report.summary.max >= Duration::from_millis(40));
        // subscription removed once the batch is done
        assert_eq!(broker.subscriber_count("probe/test"), 0);
        assert!(pair.is_open());
    }

    #[tokio::test]
    async fn foreign_payloads_are_dropped_without_counting() {
        let broker = MockBroker::with_faults(MockFaults {
            delivery_delays: vec![Duration::from_millis(20)],
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;

        let injector = broker.clone();
        let noise = tokio::spawn(async move {
            // wait for the batch to subscribe, then add noise on the topic
            while injector.subscriber_count("probe/test") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            injector.inject("probe/test", Bytes::from_static(b"hello"));
            injector.inject("probe/test", Bytes::from_static(b"{\"ts\":1}"));
        });

        let report = run_batch(&mut pair, &batch(4)).await.expect("batch");
        noise.await.unwrap();
        assert_eq!(report.summary.count, 4);
        assert_eq!(report.malformed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_deliveries_never_complete_the_batch() {
        // Every second publish arrives as garbage: only 2 of 4 samples parse.
        let broker = MockBroker::with_faults(MockFaults {
            corrupt_every: Some(2),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        let cfg = BatchConfig {
            timeout: Some(Duration::from_millis(50)),
            ..batch(4)
        };

        match run_batch(&mut pair, &cfg).await {
            Err(ProbeError::Timeout {
                received,
                expected,
                malformed,
                ..
            }) => {
                assert_eq!(received, 2);
                assert_eq!(expected, 4);
                assert_eq!(malformed, 2);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        // a timeout is a measurement failure, not a broker fault
        assert!(pair.is_open());
    }

    #[tokio::test]
    async fn drop_limit_fails_the_batch_early() {
        let broker = MockBroker::with_faults(MockFaults {
            corrupt_every: Some(1),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        let cfg = BatchConfig {
            max_malformed: Some(2),
            timeout: None,
            ..batch(10)
        };
        assert!(matches!(
            run_batch(&mut pair, &cfg).await,
            Err(ProbeError::TooManyMalformed { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn subscribe_failure_tears_down_the_pair() {
        let broker = MockBroker::with_faults(MockFaults {
            reject_subscribe: true,
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        assert!(matches!(
            run_batch(&mut pair, &batch(3)).await,
            Err(ProbeError::Subscribe(_))
        ));
        assert!(!pair.is_open());
        assert!(broker.live_sessions().is_empty());
        assert_eq!(broker.published(), 0);
    }

    #[tokio::test]
    async fn publish_failure_tears_down_the_pair() {
        let broker = MockBroker::with_faults(MockFaults {
            fail_publish_at: Some(2),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        match run_batch(&mut pair, &batch(5)).await {
            Err(ProbeError::Publish { seq, .. }) => assert_eq!(seq, 2),
            other => panic!("expected publish failure, got {:?}", other),
        }
        assert!(!pair.is_open());
        assert!(broker.live_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_fails_within_the_timeout() {
        let broker = MockBroker::with_faults(MockFaults {
            stall_publish_at: Some(1),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        let cfg = BatchConfig {
            timeout: Some(Duration::from_millis(200)),
            ..batch(4)
        };
        match run_batch(&mut pair, &cfg).await {
            Err(ProbeError::Publish {
                seq: 1,
                source: TransportError::Timeout,
            }) => {}
            other => panic!("expected publish timeout, got {:?}", other),
        }
        assert!(!pair.is_open());
        assert!(broker.live_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_subscription_ends_the_batch() {
        let broker = MockBroker::with_faults(MockFaults {
            drop_subscriptions_at: Some(2),
            ..Default::default()
        });
        let mut pair = open_pair(&broker).await;
        match run_batch(&mut pair, &batch(5)).await {
            Err(ProbeError::DeliveryClosed { received, expected }) => {
                assert_eq!(received, 2);
                assert_eq!(expected, 5);
            }
            other => panic!("expected closed delivery stream, got {:?}", other),
        }
        // not a broker operation failure; the caller decides about teardown
        assert!(pair.is_open());
    }

    #[tokio::test]
    async fn unopened_pair_is_rejected() {
        let broker = MockBroker::new();
        let mut pair = SessionPair::new(
            Target::local(),
            Arc::new(broker.clone()),
            ConnectOptions::default(),
        );
        assert!(matches!(
            run_batch(&mut pair, &batch(1)).await,
            Err(ProbeError::NotOpen)
        ));
    }
}
