//! rumqttc backed [`BusClient`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::core::error::PublishError;
use crate::core::poller::Backoff;
use crate::publish::{BusClient, OFFLINE, Topics};

const REQUEST_QUEUE: usize = 64;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// MQTT connection that keeps reconnecting until shut down.
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Configures the client and starts driving its event loop.
    ///
    /// The broker marks the proxy offline if the bridge goes away without
    /// saying goodbye.
    pub async fn start(config: &MqttConfig, topics: &Topics) -> Result<Self, PublishError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}_publisher", topics.node_id()));

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.max(5)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_transport(transport(config).await?);
        options.set_last_will(LastWill::new(
            topics.proxy_status(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        info!(
            "Connecting to MQTT broker {}:{}{}",
            config.host,
            config.port,
            if config.tls { " over TLS" } else { "" }
        );
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&connected), shutdown.clone()));

        Ok(Self {
            client,
            connected,
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Sends DISCONNECT and stops the event loop.
    pub async fn close(&self) {
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                warn!("Failed to disconnect from MQTT broker: {}", e);
            }
            // Let the event loop write the DISCONNECT packet.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.shutdown.cancel();

        let driver = self.driver.lock().ok().and_then(|mut driver| driver.take());
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("MQTT event loop task failed: {}", e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT connection closed");
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| PublishError::Client(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Plain TCP, or TLS against `ca_cert` (system roots when unset).
async fn transport(config: &MqttConfig) -> Result<Transport, PublishError> {
    if !config.tls {
        return Ok(Transport::Tcp);
    }
    match &config.ca_cert {
        Some(path) => {
            let ca = tokio::fs::read(path).await.map_err(|e| {
                PublishError::Tls(format!("cannot read CA certificate {}: {}", path.display(), e))
            })?;
            Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}

/// Polls the event loop; rumqttc reconnects on the next poll after an error.
async fn drive(mut eventloop: EventLoop, connected: Arc<AtomicBool>, shutdown: CancellationToken) {
    let backoff = Backoff::new(RECONNECT_BASE, RECONNECT_CAP);
    let mut failures: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker");
                    connected.store(true, Ordering::SeqCst);
                    failures = 0;
                } else {
                    warn!("MQTT broker refused connection: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker closed the connection");
                connected.store(false, Ordering::SeqCst);
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                let delay = backoff.delay(failures);
                failures = failures.saturating_add(1);
                warn!("MQTT connection error: {}. Reconnecting in {:?}", e, delay);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}
