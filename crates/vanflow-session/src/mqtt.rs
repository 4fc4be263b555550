//! MQTT transport.
//!
//! Each session is one MQTT client connection. Addresses map to topics
//! unchanged. Multicast addresses use plain subscriptions; other addresses
//! use a shared subscription so the broker hands each message to a single
//! subscriber.

use crate::transport::{BusReceiver, BusSender, Connector, Session, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;
use vanflow_proto::addresses::is_multicast;
use vanflow_proto::Message;

const DEFAULT_PORT: u16 = 1883;
const SHARE_GROUP: &str = "vanflow";

/// MQTT connector configuration.
#[derive(Debug, Clone)]
pub struct MqttConnectorConfig {
    /// Broker address: `host`, `host:port`, `tcp://host:port` or `mqtt://host:port`
    pub broker: String,
    /// Client ID prefix; a random suffix is added per connection
    pub client_prefix: String,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// How long to wait for the broker to acknowledge a connect
    pub connect_timeout: Duration,
}

impl Default for MqttConnectorConfig {
    fn default() -> Self {
        Self {
            broker: "localhost:1883".to_string(),
            client_prefix: "vanflow".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connector opening one MQTT client per session.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttConnectorConfig,
    host: String,
    port: u16,
}

impl MqttConnector {
    /// Create a connector.
    ///
    /// # Errors
    ///
    /// Returns error if the broker address is invalid.
    pub fn new(config: MqttConnectorConfig) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(&config.broker)?;
        Ok(Self { config, host, port })
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!(
            "{}-{}",
            self.config.client_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.config.keep_alive);
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 100);
        tokio::time::timeout(self.config.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Connect(format!("{}: connect timed out", self.config.broker)))??;
        tracing::debug!(host = %self.host, port = self.port, "MQTT session connected");

        let routes = Arc::new(Mutex::new(Routes {
            alive: true,
            ..Routes::default()
        }));
        let task = tokio::spawn(drive(eventloop, Arc::clone(&routes)));
        Ok(Arc::new(MqttSession {
            client,
            routes,
            next_id: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        }))
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(TransportError::Connect(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
            Ok(_) => {}
            Err(err) => return Err(TransportError::Connect(err.to_string())),
        }
    }
}

/// Poll the event loop and route incoming publishes until the connection
/// fails. Dropping the routes on failure closes every receiver.
async fn drive(mut eventloop: EventLoop, routes: Arc<Mutex<Routes>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = match Message::from_cbor(&publish.payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::warn!(topic = %publish.topic, error = %err, "Dropping undecodable MQTT payload");
                        continue;
                    }
                };
                lock(&routes).dispatch(&publish.topic, &msg);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "MQTT connection lost");
                lock(&routes).shutdown();
                return;
            }
        }
    }
}

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Routes {
    alive: bool,
    by_topic: HashMap<String, Vec<(u64, mpsc::Sender<Message>)>>,
}

impl Routes {
    fn dispatch(&mut self, topic: &str, msg: &Message) {
        let Some(subs) = self.by_topic.get_mut(topic) else {
            return;
        };
        subs.retain(|(_, tx)| !tx.is_closed());
        for (id, tx) in subs.iter() {
            if tx.try_send(msg.clone()).is_err() {
                tracing::trace!(topic, receiver = id, "Receiver buffer full, dropping");
            }
        }
    }

    fn shutdown(&mut self) {
        self.alive = false;
        self.by_topic.clear();
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if self.alive {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Remove a route; returns whether it was the last one for its topic.
    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(subs) = self.by_topic.get_mut(topic) else {
            return false;
        };
        subs.retain(|(sub, _)| *sub != id);
        if subs.is_empty() {
            self.by_topic.remove(topic);
            return true;
        }
        false
    }
}

struct MqttSession {
    client: AsyncClient,
    routes: Arc<Mutex<Routes>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Session for MqttSession {
    async fn new_sender(&self, address: &str) -> Result<Arc<dyn BusSender>, TransportError> {
        lock(&self.routes).check_alive()?;
        Ok(Arc::new(MqttSender {
            client: self.client.clone(),
            routes: Arc::clone(&self.routes),
            topic: address.to_string(),
        }))
    }

    async fn new_receiver(
        &self,
        address: &str,
        credit: usize,
    ) -> Result<Arc<dyn BusReceiver>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(credit.max(1));
        {
            let mut routes = lock(&self.routes);
            routes.check_alive()?;
            routes
                .by_topic
                .entry(address.to_string())
                .or_default()
                .push((id, tx));
        }
        let filter = subscription_filter(address);
        if let Err(err) = self.client.subscribe(&filter, QoS::AtLeastOnce).await {
            lock(&self.routes).remove(address, id);
            return Err(TransportError::Attach {
                address: address.to_string(),
                reason: err.to_string(),
            });
        }
        tracing::debug!(address, filter, "MQTT receiver attached");
        Ok(Arc::new(MqttReceiver {
            client: self.client.clone(),
            routes: Arc::clone(&self.routes),
            topic: address.to_string(),
            id,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn close(&self) {
        lock(&self.routes).shutdown();
        if let Err(err) = self.client.disconnect().await {
            tracing::trace!(error = %err, "MQTT disconnect failed");
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

struct MqttSender {
    client: AsyncClient,
    routes: Arc<Mutex<Routes>>,
    topic: String,
}

#[async_trait]
impl BusSender for MqttSender {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        lock(&self.routes).check_alive()?;
        let payload = msg
            .to_cbor()
            .map_err(|err| TransportError::Send(err.to_string()))?;
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&self) {}
}

struct MqttReceiver {
    client: AsyncClient,
    routes: Arc<Mutex<Routes>>,
    topic: String,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

#[async_trait]
impl BusReceiver for MqttReceiver {
    async fn receive(&self) -> Result<Message, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn accept(&self, _msg: &Message) -> Result<(), TransportError> {
        lock(&self.routes).check_alive()
    }

    async fn close(&self) {
        let last = lock(&self.routes).remove(&self.topic, self.id);
        if last {
            let filter = subscription_filter(&self.topic);
            if let Err(err) = self.client.unsubscribe(&filter).await {
                tracing::trace!(filter, error = %err, "MQTT unsubscribe failed");
            }
        }
    }
}

impl Drop for MqttReceiver {
    fn drop(&mut self) {
        lock(&self.routes).remove(&self.topic, self.id);
    }
}

/// Topic filter used to receive messages sent to `address`.
fn subscription_filter(address: &str) -> String {
    if is_multicast(address) {
        address.to_string()
    } else {
        format!("$share/{SHARE_GROUP}/{address}")
    }
}

fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)));
    }

    let (host, port) = match input.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (input, None),
    };
    if host.is_empty() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: missing host"
        )));
    }
    let port = match port {
        None => DEFAULT_PORT,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    Ok((host.to_string(), port))
}
