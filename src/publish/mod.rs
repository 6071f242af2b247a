//! Home Assistant publishing.
//!
//! The publisher runs on its own task and is fed through a bounded channel,
//! so a slow or unreachable broker never holds up polling. While the bus is
//! down messages wait in a small queue; when the queue overflows the oldest
//! message is dropped.

pub mod mqtt;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::config::{DeviceConfig, HomeAssistantConfig};
use crate::core::error::PublishError;
use crate::core::profile::{MetricKind, SensorProfile, UNKNOWN_LABEL};
use crate::core::reading::Reading;

pub use mqtt::MqttBus;

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Message bus the publisher writes to.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publishes with at-least-once delivery.
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;
}

/// Every topic the bridge writes to, derived from one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    discovery_prefix: String,
    state_prefix: String,
    node_id: String,
}

impl Topics {
    pub fn new(config: &HomeAssistantConfig) -> Self {
        Self {
            discovery_prefix: config.discovery_prefix.trim_end_matches('/').to_string(),
            state_prefix: config.state_prefix.trim_end_matches('/').to_string(),
            node_id: config.node_id.clone(),
        }
    }

    pub fn discovery(&self, unique_id: &str) -> String {
        format!("{}/device/{}/config", self.discovery_prefix, unique_id)
    }

    pub fn state(&self, unique_id: &str) -> String {
        format!("{}/{}/state", self.state_prefix, unique_id)
    }

    pub fn availability(&self, unique_id: &str) -> String {
        format!("{}/{}/availability", self.state_prefix, unique_id)
    }

    pub fn proxy_status(&self) -> String {
        format!("ble_proxy/{}/status", self.node_id)
    }

    pub fn proxy_discovery(&self) -> String {
        format!("{}/binary_sensor/{}_status/config", self.discovery_prefix, self.node_id)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Home Assistant device discovery payload with one component per metric.
pub fn discovery_payload(topics: &Topics, device: &DeviceConfig, profile: &SensorProfile) -> Value {
    let uid = &device.unique_id;

    let mut components = Map::new();
    for metric in &profile.metrics {
        let object_id = format!("{}_{}", uid, metric.name);
        let mut component = json!({
            "p": "sensor",
            "name": metric.display_name,
            "unique_id": object_id,
            "device_class": metric.device_class,
            "value_template": format!("{{{{ value_json.{} }}}}", metric.name),
        });
        match &metric.kind {
            MetricKind::Number { unit, .. } => {
                component["unit_of_measurement"] = json!(unit);
                component["state_class"] = json!("measurement");
            }
            MetricKind::Label(labels) => {
                let mut options = labels.to_vec();
                options.push(UNKNOWN_LABEL);
                component["options"] = json!(options);
            }
        }
        if metric.diagnostic {
            component["entity_category"] = json!("diagnostic");
        }
        components.insert(object_id, component);
    }

    let mut identity = json!({
        "identifiers": [uid],
        "name": device.name,
        "manufacturer": profile.manufacturer,
        "model": profile.model,
        "connections": [["bluetooth", device.address]],
        "via_device": topics.node_id(),
    });
    if let Some(product_id) = &device.product_id {
        identity["model_id"] = json!(product_id);
    }

    json!({
        "device": identity,
        "origin": {
            "name": env!("CARGO_PKG_NAME"),
            "sw_version": env!("CARGO_PKG_VERSION"),
        },
        "components": Value::Object(components),
        "state_topic": topics.state(uid),
        "availability_topic": topics.availability(uid),
        "qos": 1,
    })
}

/// JSON state object, one key per metric that was reported.
pub fn state_payload(reading: &Reading) -> Value {
    json!(reading.metrics)
}

/// Discovery for the binary sensor that tracks whether the bridge is up.
pub fn proxy_discovery_payload(topics: &Topics) -> Value {
    let node_id = topics.node_id();
    json!({
        "name": "BLE Proxy Status",
        "unique_id": format!("{}_status", node_id),
        "state_topic": topics.proxy_status(),
        "payload_on": ONLINE,
        "payload_off": OFFLINE,
        "device_class": "connectivity",
        "entity_category": "diagnostic",
        "device": {
            "identifiers": [node_id],
            "name": "BLE Proxy",
            "manufacturer": env!("CARGO_PKG_NAME"),
            "sw_version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// What the poller hands to the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    Reading(Reading),
    Availability { unique_id: String, online: bool },
    ProxyStatus { online: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    /// Messages kept while the bus is down.
    pub max_pending: usize,
    pub publish_timeout: Duration,
    /// Events buffered between the poller and the publisher task.
    pub channel_capacity: usize,
    /// How often the queue is retried while the bus is down.
    pub flush_interval: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            max_pending: 32,
            publish_timeout: Duration::from_secs(5),
            channel_capacity: 64,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    payload: String,
    retain: bool,
    /// Set for a device discovery, so it can be re-sent if dropped.
    announces: Option<String>,
}

/// Sending side of the publisher. Never blocks.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublishEvent>,
}

impl PublisherHandle {
    pub fn send(&self, event: PublishEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Publisher busy, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => warn!("Publisher has stopped, event dropped"),
        }
    }
}

/// Turns events into bus messages and delivers them.
pub struct Publisher<B: BusClient + ?Sized> {
    bus: Arc<B>,
    topics: Topics,
    devices: HashMap<String, DeviceConfig>,
    profile: SensorProfile,
    settings: PublisherSettings,
    pending: VecDeque<Message>,
    announced: HashSet<String>,
    proxy_announced: bool,
}

impl<B: BusClient + ?Sized + 'static> Publisher<B> {
    pub fn new(
        bus: Arc<B>,
        topics: Topics,
        devices: &[DeviceConfig],
        profile: SensorProfile,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            bus,
            topics,
            devices: devices
                .iter()
                .map(|d| (d.unique_id.clone(), d.clone()))
                .collect(),
            profile,
            settings,
            pending: VecDeque::new(),
            announced: HashSet::new(),
            proxy_announced: false,
        }
    }

    /// Starts the publisher task. It ends once every handle is dropped and
    /// the queue has been given a last chance to flush.
    pub fn spawn(self) -> (PublisherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (PublisherHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PublishEvent>) {
        let mut ticker = interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        self.handle(event);
                        self.flush().await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;
        if !self.pending.is_empty() {
            warn!("Publisher stopped with {} undelivered message(s)", self.pending.len());
        }
        debug!("Publisher task finished");
    }

    fn handle(&mut self, event: PublishEvent) {
        match event {
            PublishEvent::Reading(reading) => self.queue_reading(&reading),
            PublishEvent::Availability { unique_id, online } => {
                let topic = self.topics.availability(&unique_id);
                self.enqueue(Message {
                    topic,
                    payload: status(online).to_string(),
                    retain: true,
                    announces: None,
                });
            }
            PublishEvent::ProxyStatus { online } => {
                if online && !self.proxy_announced {
                    self.proxy_announced = true;
                    self.enqueue(Message {
                        topic: self.topics.proxy_discovery(),
                        payload: proxy_discovery_payload(&self.topics).to_string(),
                        retain: true,
                        announces: None,
                    });
                }
                self.enqueue(Message {
                    topic: self.topics.proxy_status(),
                    payload: status(online).to_string(),
                    retain: true,
                    announces: None,
                });
            }
        }
    }

    fn queue_reading(&mut self, reading: &Reading) {
        let uid = reading.device_unique_id.as_str();

        if !self.announced.contains(uid) {
            match self.devices.get(uid) {
                Some(device) => {
                    let payload = discovery_payload(&self.topics, device, &self.profile);
                    self.announced.insert(uid.to_string());
                    self.enqueue(Message {
                        topic: self.topics.discovery(uid),
                        payload: payload.to_string(),
                        retain: true,
                        announces: Some(uid.to_string()),
                    });
                }
                None => warn!("No device configured for reading from {}", uid),
            }
        }

        self.enqueue(Message {
            topic: self.topics.state(uid),
            payload: state_payload(reading).to_string(),
            retain: true,
            announces: None,
        });
    }

    fn enqueue(&mut self, message: Message) {
        while self.pending.len() >= self.settings.max_pending.max(1) {
            if let Some(dropped) = self.pending.pop_front() {
                warn!("Publish queue full, dropping message for {}", dropped.topic);
                if let Some(uid) = dropped.announces {
                    self.announced.remove(&uid);
                }
            }
        }
        self.pending.push_back(message);
    }

    /// Delivers queued messages in order until the bus stops accepting them.
    async fn flush(&mut self) {
        while let Some(message) = self.pending.front() {
            if !self.bus.is_connected() {
                debug!("Bus not connected, {} message(s) waiting", self.pending.len());
                return;
            }

            let sent = timeout(
                self.settings.publish_timeout,
                self.bus.publish(&message.topic, &message.payload, message.retain),
            )
            .await
            .unwrap_or(Err(PublishError::Timeout(self.settings.publish_timeout)));

            match sent {
                Ok(()) => {
                    debug!("Published {}", message.topic);
                    self.pending.pop_front();
                }
                Err(PublishError::NotConnected) | Err(PublishError::Timeout(_)) => {
                    info!("Publish to {} deferred until the bus is back", message.topic);
                    return;
                }
                Err(e) => {
                    warn!("Dropping message for {}: {}", message.topic, e);
                    if let Some(dropped) = self.pending.pop_front() {
                        if let Some(uid) = dropped.announces {
                            self.announced.remove(&uid);
                        }
                    }
                }
            }
        }
    }
}

fn status(online: bool) -> &'static str {
    if online { ONLINE } else { OFFLINE }
}
