//! MQTT adapter (feature `transport-mqtt`), using rumqttc (async).
//!
//! Every session owns one `AsyncClient` plus a background task polling its
//! event loop. `open` drives the event loop until CONNACK before handing the
//! loop to that task, and `subscribe` waits for the matching SUBACK, so
//! refused connections and rejected subscriptions surface as errors instead of
//! silently stalling a batch.
use crate::transport::config::split_endpoint;
use crate::transport::{
    ConnectOptions, Connector, MessageHandler, Qos, Session, TransportError, TransportMessage,
};
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS, SubAck, SubscribeReasonCode,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type SharedHandler = Arc<dyn Fn(TransportMessage) + Send + Sync + 'static>;

// topic -> handler; exact topic match only
type Handlers = Arc<RwLock<HashMap<String, SharedHandler>>>;

#[derive(Clone, Debug)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self {
            request_capacity: 1024,
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connector for MqttConnector {
    async fn open(
        &self,
        endpoint: &str,
        identity: &str,
        opts: &ConnectOptions,
    ) -> Result<Box<dyn Session>, TransportError> {
        let (host, port) = split_endpoint(endpoint)?;
        let mut options = MqttOptions::new(identity, host, port);
        options.set_keep_alive(opts.keep_alive());
        options.set_clean_session(opts.clean_start);
        let (client, mut eventloop) = AsyncClient::new(options, self.request_capacity.max(10));

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => break Ok(ack),
                    Ok(_) => {}
                    Err(e) => break Err(TransportError::Connect(e.to_string())),
                }
            }
        };
        let connack = match tokio::time::timeout(opts.connect_timeout(), handshake).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(%endpoint, %identity, timeout = ?opts.connect_timeout(), "No CONNACK before timeout");
                return Err(TransportError::Timeout);
            }
        };
        debug!(%endpoint, %identity, session_present = connack.session_present, "MQTT session connected");

        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        let (suback_tx, suback_rx) = flume::unbounded::<SubAck>();
        let poller = {
            let handlers = Arc::clone(&handlers);
            let identity = identity.to_string();
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Incoming::Publish(p))) => {
                            let handler = handlers
                                .read()
                                .unwrap_or_else(|e| e.into_inner())
                                .get(p.topic.as_str())
                                .cloned();
                            if let Some(h) = handler {
                                (h)(TransportMessage {
                                    topic: p.topic,
                                    payload: p.payload,
                                });
                            }
                        }
                        Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                            let _ = suback_tx.send(ack);
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            warn!(%identity, "Broker closed the session");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(%identity, error = %e, "MQTT event loop stopped");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Box::new(MqttSession {
            identity: identity.to_string(),
            client,
            handlers,
            suback_rx,
            ack_timeout: opts.connect_timeout(),
            poller: tokio::sync::Mutex::new(Some(poller)),
        }))
    }
}

pub struct MqttSession {
    identity: String,
    client: AsyncClient,
    handlers: Handlers,
    suback_rx: flume::Receiver<SubAck>,
    ack_timeout: Duration,
    poller: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    fn set_handler(&self, topic: &str, handler: Option<SharedHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        match handler {
            Some(h) => {
                handlers.insert(topic.to_string(), h);
            }
            None => {
                handlers.remove(topic);
            }
        }
    }
}

fn to_rumqttc(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[async_trait::async_trait]
impl Session for MqttSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(topic, to_rumqttc(qos), false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        // Install first so nothing delivered right after SUBACK is missed.
        self.set_handler(topic, Some(Arc::from(handler)));
        while self.suback_rx.try_recv().is_ok() {}

        if let Err(e) = self.client.subscribe(topic, to_rumqttc(qos)).await {
            self.set_handler(topic, None);
            return Err(TransportError::Subscribe(e.to_string()));
        }

        let ack = match tokio::time::timeout(self.ack_timeout, self.suback_rx.recv_async()).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => {
                self.set_handler(topic, None);
                return Err(TransportError::Disconnected);
            }
            Err(_) => {
                self.set_handler(topic, None);
                warn!(identity = %self.identity, %topic, timeout = ?self.ack_timeout, "No SUBACK before timeout");
                return Err(TransportError::Timeout);
            }
        };

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            self.set_handler(topic, None);
            return Err(TransportError::Subscribe(format!(
                "broker rejected subscription to '{}'",
                topic
            )));
        }
        debug!(identity = %self.identity, %topic, %qos, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.set_handler(topic, None);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let res = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Close(e.to_string()));
        if let Some(mut handle) = self.poller.lock().await.take() {
            if tokio::time::timeout(self.ack_timeout, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        res
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}
