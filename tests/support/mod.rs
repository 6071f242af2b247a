//! Simulated Tuya sensors and a recording message bus.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;

use tuya_ble_bridge_lib::config::DeviceConfig;
use tuya_ble_bridge_lib::core::bluetooth::{
    BleConnection, BleTransport, ChunkStream, DiscoveredDevice, DiscoveryStream, ScanFilter,
};
use tuya_ble_bridge_lib::core::protocol::{
    Command, DEFAULT_MTU, DataPoint, DpValue, Frame, Reassembler, SealedFrame, SessionKey,
    decode_points, encode_frame, encode_points, fragment,
};
use tuya_ble_bridge_lib::core::{PublishError, TransportError};
use tuya_ble_bridge_lib::publish::BusClient;

pub const LOCAL_KEY: &str = "0123456789abcdef";
pub const SESSION_KEY: &[u8; 16] = b"SESSION-KEY-0042";

pub fn sgs01_a() -> DeviceConfig {
    device("sgs01_a", "A4:C1:38:00:00:0A")
}

pub fn device(unique_id: &str, address: &str) -> DeviceConfig {
    DeviceConfig::new(unique_id, address, "bf0123456789", LOCAL_KEY, unique_id)
}

/// moisture 45 %, temperature 22.5 °C, battery 87 % and high
pub fn sgs01_report() -> Vec<DataPoint> {
    vec![
        DataPoint::new(3, DpValue::Integer(225)),
        DataPoint::new(4, DpValue::Integer(45)),
        DataPoint::new(14, DpValue::Enum(2)),
        DataPoint::new(15, DpValue::Integer(87)),
    ]
}

/// How a simulated sensor reacts.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub local_key: String,
    pub report: Vec<DataPoint>,
    pub refuse_connect: bool,
    pub connect_delay: Option<Duration>,
    /// Never answers anything.
    pub silent: bool,
    /// Answers pairing with a non-zero status.
    pub reject_pairing: bool,
    /// Pairing responses to ignore before answering.
    pub drop_pair_responses: usize,
    /// Sends a report with a foreign seq before the real one.
    pub stale_report_first: bool,
    /// Sends each data point in a frame of its own.
    pub split_report: bool,
    /// Corrupts this many report frames before sending a good one.
    pub garbled_reports: usize,
    /// Only reports the first data point.
    pub partial_report: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            local_key: LOCAL_KEY.to_string(),
            report: sgs01_report(),
            refuse_connect: false,
            connect_delay: None,
            silent: false,
            reject_pairing: false,
            drop_pair_responses: 0,
            stale_report_first: false,
            split_report: false,
            garbled_reports: 0,
            partial_report: false,
        }
    }
}

/// What the simulated sensors observed.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub connect_attempts: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub pair_requests: usize,
    pub pokes: usize,
    /// `(address, command, seq)` of every complete frame received
    pub frames: Vec<(String, Command, u16)>,
}

#[derive(Default)]
pub struct SimulatedTransport {
    devices: Mutex<HashMap<String, Behavior>>,
    stats: Arc<Mutex<Stats>>,
    advertisements: Mutex<Vec<DiscoveredDevice>>,
}

impl SimulatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_device(self: &Arc<Self>, address: &str, behavior: Behavior) -> Arc<Self> {
        self.devices
            .lock()
            .unwrap()
            .insert(address.to_string(), behavior);
        Arc::clone(self)
    }

    pub fn advertise(&self, device: DiscoveredDevice) {
        self.advertisements.lock().unwrap().push(device);
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn scan(&self, _filter: &ScanFilter) -> Result<DiscoveryStream, TransportError> {
        let seen = self.advertisements.lock().unwrap().clone();
        // Advertisements repeat; the stream stays open like a real scan.
        Ok(Box::pin(stream::iter(seen).chain(stream::pending())))
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn BleConnection>, TransportError> {
        let behavior = self
            .devices
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;
        self.stats.lock().unwrap().connect_attempts += 1;

        if let Some(delay) = behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if behavior.refuse_connect {
            return Err(TransportError::ConnectionRefused {
                address: address.to_string(),
                reason: "radio busy".into(),
            });
        }

        self.stats.lock().unwrap().connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(SimulatedConnection {
            address: address.to_string(),
            key: SessionKey::from_local_key(&behavior.local_key),
            behavior,
            stats: Arc::clone(&self.stats),
            inbound: Reassembler::new(),
            tx,
            rx: Some(rx),
            garbled_sent: 0,
            pair_dropped: 0,
            closed: false,
        }))
    }
}

pub struct SimulatedConnection {
    address: String,
    behavior: Behavior,
    key: SessionKey,
    stats: Arc<Mutex<Stats>>,
    inbound: Reassembler,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    garbled_sent: usize,
    pair_dropped: usize,
    closed: bool,
}

impl SimulatedConnection {
    fn send(&self, command: Command, seq: u16, body: Vec<u8>, corrupt: bool) {
        let mut bytes = encode_frame(&Frame::new(command, seq, body), &self.key).unwrap();
        if corrupt {
            bytes[8] ^= 0xFF;
        }
        for chunk in fragment(&bytes, DEFAULT_MTU).unwrap() {
            let _ = self.tx.send(chunk);
        }
    }

    fn handle(&mut self, bytes: Vec<u8>) {
        let sealed = match SealedFrame::open(&bytes) {
            Ok(sealed) => sealed,
            Err(_) => return,
        };
        let (command, seq) = (sealed.command, sealed.seq);
        self.stats
            .lock()
            .unwrap()
            .frames
            .push((self.address.clone(), command, seq));
        if self.behavior.silent {
            return;
        }

        match command {
            Command::PairRequest => {
                self.stats.lock().unwrap().pair_requests += 1;
                if self.pair_dropped < self.behavior.drop_pair_responses {
                    self.pair_dropped += 1;
                    return;
                }
                // A sensor with another key still answers, in its own key.
                let status = if self.behavior.reject_pairing { 1 } else { 0 };
                let mut body = vec![status];
                body.extend_from_slice(SESSION_KEY);
                self.send(Command::PairResponse, seq, body, false);
                if status == 0 && sealed.decrypt(&self.key).is_ok() {
                    self.key = SessionKey::from_bytes(*SESSION_KEY);
                }
            }
            Command::DpWrite => {
                let points = match sealed.decrypt(&self.key).and_then(|f| decode_points(&f.body)) {
                    Ok(points) => points,
                    Err(_) => return,
                };
                if points.iter().any(|p| p.id == 9) {
                    self.stats.lock().unwrap().pokes += 1;
                }
                self.report(seq);
            }
            _ => {}
        }
    }

    fn report(&mut self, seq: u16) {
        if self.behavior.stale_report_first {
            let stale = vec![DataPoint::new(4, DpValue::Integer(99))];
            let body = encode_points(&stale).unwrap();
            self.send(Command::DpReport, seq.wrapping_add(100), body, false);
        }
        while self.garbled_sent < self.behavior.garbled_reports {
            self.garbled_sent += 1;
            self.send(Command::DpReport, seq, encode_points(&self.behavior.report).unwrap(), true);
        }

        let report = if self.behavior.partial_report {
            self.behavior.report[..1].to_vec()
        } else {
            self.behavior.report.clone()
        };
        if self.behavior.split_report {
            for point in report {
                self.send(Command::DpReport, seq, encode_points(&[point]).unwrap(), false);
            }
        } else {
            self.send(Command::DpReport, seq, encode_points(&report).unwrap(), false);
        }
    }
}

#[async_trait]
impl BleConnection for SimulatedConnection {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        if let Ok(Some(frame)) = self.inbound.push(chunk) {
            self.handle(frame);
        }
        Ok(())
    }

    async fn notifications(&mut self) -> Result<ChunkStream, TransportError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| TransportError::SubscribeFailed("already subscribed".into()))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.stats.lock().unwrap().disconnects += 1;
        }
        Ok(())
    }
}

/// Bus that records every publish and can be switched online/offline.
#[derive(Default)]
pub struct RecordingBus {
    connected: AtomicBool,
    published: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingBus {
    pub fn connected() -> Arc<Self> {
        let bus = Self::default();
        bus.connected.store(true, Ordering::SeqCst);
        Arc::new(bus)
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, String, bool)> {
        self.published.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published().into_iter().map(|(topic, _, _)| topic).collect()
    }
}

#[async_trait]
impl BusClient for RecordingBus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
