//! One connection lifecycle of a Tuya BLE sensor.
//!
//! A session connects, pairs with the local key, writes the poke data point
//! and collects the reported values. It is never reused: every poll starts
//! from `Disconnected` and ends there, whatever happened in between.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::{Instant, timeout, timeout_at};

use crate::config::{DeviceConfig, PollingConfig};
use crate::core::bluetooth::{BleConnection, BleTransport, ChunkStream, DISCONNECT_TIMEOUT_SECS};
use crate::core::error::{FrameError, PollFailure, TransportError};
use crate::core::profile::SensorProfile;
use crate::core::protocol::{
    Command, Frame, KEY_LENGTH, Reassembler, SealedFrame, SessionKey, encode_frame, encode_points,
    fragment,
};
use crate::core::reading::{PollOutcome, Reading};

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Polling,
    Disconnecting,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Ready => "ready",
            SessionPhase::Polling => "polling",
            SessionPhase::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Timing and framing knobs of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub response_timeout: Duration,
    pub max_frame_retries: u32,
    pub mtu: usize,
    pub disconnect_timeout: Duration,
}

impl SessionSettings {
    pub fn from_polling(polling: &PollingConfig) -> Self {
        Self {
            response_timeout: polling.response_timeout(),
            max_frame_retries: polling.max_frame_retries,
            mtu: polling.mtu,
            ..Self::default()
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            max_frame_retries: 2,
            mtu: crate::core::protocol::DEFAULT_MTU,
            disconnect_timeout: Duration::from_secs(DISCONNECT_TIMEOUT_SECS),
        }
    }
}

/// Per-connection mutable state. Created for one poll and dropped after it.
struct SessionState {
    unique_id: String,
    next_seq: u16,
    key: SessionKey,
    phase: SessionPhase,
    reassembler: Reassembler,
}

impl SessionState {
    fn new(device: &DeviceConfig) -> Self {
        Self {
            unique_id: device.unique_id.clone(),
            next_seq: 1,
            key: device.local_key(),
            phase: SessionPhase::Disconnected,
            reassembler: Reassembler::new(),
        }
    }

    fn take_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = match self.next_seq.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        seq
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!("{}: {} -> {}", self.unique_id, self.phase, phase);
        self.phase = phase;
    }
}

/// What arrived on the notification stream before the wait expired.
enum Inbound {
    Frame(SealedFrame),
    Garbled(FrameError),
    Silent,
}

/// Polls devices over a shared transport, one connection per call.
pub struct DeviceSession<T: BleTransport + ?Sized> {
    transport: Arc<T>,
    settings: SessionSettings,
    profile: Arc<SensorProfile>,
}

impl<T: BleTransport + ?Sized> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            profile: Arc::clone(&self.profile),
        }
    }
}

impl<T: BleTransport + ?Sized> DeviceSession<T> {
    pub fn new(transport: Arc<T>, settings: SessionSettings, profile: SensorProfile) -> Self {
        Self {
            transport,
            settings,
            profile: Arc::new(profile),
        }
    }

    /// Reads the device once.
    ///
    /// `budget` bounds connect, pairing, poke and the wait for the report.
    /// The connection is closed before returning on every path.
    pub async fn poll(&self, device: &DeviceConfig, budget: Duration) -> PollOutcome {
        let result = self.run(device, budget).await;

        match &result {
            Ok(reading) => info!("{}: {}", device.unique_id, reading.summary()),
            Err(PollFailure::Auth(reason)) => error!(
                "{}: authentication failed ({}). Check the local_key of '{}'",
                device.unique_id, reason, device.name
            ),
            Err(failure) => warn!("{}: poll failed: {}", device.unique_id, failure),
        }

        PollOutcome {
            unique_id: device.unique_id.clone(),
            name: device.name.clone(),
            attempts: 1,
            result,
        }
    }

    async fn run(&self, device: &DeviceConfig, budget: Duration) -> Result<Reading, PollFailure> {
        let deadline = Instant::now() + budget;
        let mut state = SessionState::new(device);

        state.set_phase(SessionPhase::Connecting);
        let connected = timeout_at(deadline, self.transport.connect(&device.address)).await;
        let mut connection = match connected {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                state.set_phase(SessionPhase::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                state.set_phase(SessionPhase::Disconnected);
                return Err(PollFailure::Timeout {
                    phase: SessionPhase::Connecting,
                    budget,
                });
            }
        };

        let exchange = self.exchange(connection.as_mut(), &mut state, device);
        let exchanged = timeout_at(deadline, exchange).await;
        let result = match exchanged {
            Ok(result) => result,
            Err(_) => Err(PollFailure::Timeout {
                phase: state.phase,
                budget,
            }),
        };

        self.release(connection.as_mut(), &mut state).await;
        result
    }

    async fn exchange(
        &self,
        connection: &mut dyn BleConnection,
        state: &mut SessionState,
        device: &DeviceConfig,
    ) -> Result<Reading, PollFailure> {
        state.set_phase(SessionPhase::Negotiating);
        let mut inbound = connection.notifications().await?;

        let session_key = self.negotiate(connection, &mut inbound, state, device).await?;
        state.key = session_key;
        state.set_phase(SessionPhase::Ready);

        self.collect(connection, &mut inbound, state).await
    }

    /// Sends the pairing request until a matching response arrives or the
    /// retry budget runs out.
    async fn negotiate(
        &self,
        connection: &mut dyn BleConnection,
        inbound: &mut ChunkStream,
        state: &mut SessionState,
        device: &DeviceConfig,
    ) -> Result<SessionKey, PollFailure> {
        let body = pairing_body(device.pairing_uuid(), &state.key);
        let retries = self.settings.max_frame_retries;
        let mut last_error = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                debug!("{}: re-sending pairing request ({}/{})", state.unique_id, attempt, retries);
            }
            let seq = state.take_seq();
            self.send(connection, state, Command::PairRequest, seq, body.clone()).await?;

            let until = Instant::now() + self.settings.response_timeout;
            last_error = loop {
                let sealed = match next_frame(inbound, &mut state.reassembler, until).await? {
                    Inbound::Silent => break None,
                    Inbound::Garbled(e) => {
                        warn!("{}: garbled pairing response: {}", state.unique_id, e);
                        break Some(e);
                    }
                    Inbound::Frame(sealed) => sealed,
                };
                if sealed.command != Command::PairResponse || sealed.seq != seq {
                    debug!(
                        "{}: ignoring {:?} seq {} while waiting for pairing seq {}",
                        state.unique_id, sealed.command, sealed.seq, seq
                    );
                    continue;
                }

                let frame = match sealed.decrypt(&state.key) {
                    Ok(frame) => frame,
                    Err(FrameError::InvalidPadding) => {
                        return Err(PollFailure::Auth(
                            "pairing response does not decrypt under the local key".into(),
                        ));
                    }
                    Err(e) => break Some(e),
                };
                match parse_pair_response(&frame) {
                    Ok(key) => return Ok(key),
                    Err(PairError::Rejected(status)) => {
                        return Err(PollFailure::Auth(format!(
                            "pairing rejected with status {}",
                            status
                        )));
                    }
                    Err(PairError::Malformed(e)) => break Some(e),
                }
            };
        }

        Err(match last_error {
            Some(last) => PollFailure::Protocol { retries, last },
            None => PollFailure::Timeout {
                phase: SessionPhase::Negotiating,
                budget: self.settings.response_timeout,
            },
        })
    }

    /// Writes the poke once and merges matching reports into a reading.
    async fn collect(
        &self,
        connection: &mut dyn BleConnection,
        inbound: &mut ChunkStream,
        state: &mut SessionState,
    ) -> Result<Reading, PollFailure> {
        let seq = state.take_seq();
        let body = encode_points(std::slice::from_ref(&self.profile.poke))
            .map_err(|last| PollFailure::Protocol { retries: 0, last })?;
        state.set_phase(SessionPhase::Polling);
        self.send(connection, state, Command::DpWrite, seq, body).await?;

        let retries = self.settings.max_frame_retries;
        let until = Instant::now() + self.settings.response_timeout;
        let mut metrics = BTreeMap::new();
        let mut garbled = 0;

        loop {
            let points = match next_frame(inbound, &mut state.reassembler, until).await? {
                Inbound::Silent => {
                    if !metrics.is_empty() {
                        debug!("{}: discarding partial report {:?}", state.unique_id, metrics);
                    }
                    return Err(PollFailure::Timeout {
                        phase: SessionPhase::Polling,
                        budget: self.settings.response_timeout,
                    });
                }
                Inbound::Garbled(e) => Err(e),
                Inbound::Frame(sealed) => {
                    if sealed.command != Command::DpReport || sealed.seq != seq {
                        debug!(
                            "{}: ignoring {:?} seq {} while waiting for report seq {}",
                            state.unique_id, sealed.command, sealed.seq, seq
                        );
                        continue;
                    }
                    sealed.decrypt(&state.key).and_then(|frame| frame.data_points())
                }
            };

            let points = match points {
                Ok(points) => points,
                Err(e) => {
                    garbled += 1;
                    if garbled > retries {
                        return Err(PollFailure::Protocol { retries, last: e });
                    }
                    warn!("{}: discarding garbled report: {}", state.unique_id, e);
                    continue;
                }
            };

            for point in points {
                match self.profile.metric_for(point.id) {
                    Some(metric) => match metric.convert(&point.value) {
                        Some(value) => {
                            metrics.insert(metric.name.to_string(), value);
                        }
                        None => warn!(
                            "{}: DP {} has unusable value {:?}",
                            state.unique_id, point.id, point.value
                        ),
                    },
                    None => {
                        debug!("{}: ignoring DP {} = {:?}", state.unique_id, point.id, point.value)
                    }
                }
            }

            if self.profile.required_metrics().all(|m| metrics.contains_key(m.name)) {
                state.set_phase(SessionPhase::Ready);
                return Ok(Reading::new(&state.unique_id, metrics));
            }
        }
    }

    async fn send(
        &self,
        connection: &mut dyn BleConnection,
        state: &SessionState,
        command: Command,
        seq: u16,
        body: Vec<u8>,
    ) -> Result<(), PollFailure> {
        let protocol = |last| PollFailure::Protocol { retries: 0, last };
        let bytes = encode_frame(&Frame::new(command, seq, body), &state.key).map_err(protocol)?;
        let chunks = fragment(&bytes, self.settings.mtu).map_err(protocol)?;

        debug!(
            "{}: sending {:?} seq {} in {} chunk(s)",
            state.unique_id,
            command,
            seq,
            chunks.len()
        );
        for chunk in &chunks {
            connection.write(chunk).await?;
        }
        Ok(())
    }

    async fn release(&self, connection: &mut dyn BleConnection, state: &mut SessionState) {
        state.set_phase(SessionPhase::Disconnecting);
        match timeout(self.settings.disconnect_timeout, connection.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: disconnect failed: {}", state.unique_id, e),
            Err(_) => warn!(
                "{}: disconnect did not complete within {:?}",
                state.unique_id, self.settings.disconnect_timeout
            ),
        }
        state.set_phase(SessionPhase::Disconnected);
    }
}

/// Waits for the next complete frame, up to `until`.
async fn next_frame(
    inbound: &mut ChunkStream,
    reassembler: &mut Reassembler,
    until: Instant,
) -> Result<Inbound, PollFailure> {
    loop {
        let chunk = match timeout_at(until, inbound.next()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Err(TransportError::Disconnected.into()),
            Err(_) => {
                reassembler.reset();
                return Ok(Inbound::Silent);
            }
        };
        match reassembler.push(&chunk) {
            Ok(None) => continue,
            Ok(Some(bytes)) => {
                return Ok(match SealedFrame::open(&bytes) {
                    Ok(sealed) => Inbound::Frame(sealed),
                    Err(e) => Inbound::Garbled(e),
                });
            }
            Err(e) => return Ok(Inbound::Garbled(e)),
        }
    }
}

/// uuid (zero padded to 16) | local key | 6 byte nonce
fn pairing_body(uuid: &str, local_key: &SessionKey) -> Vec<u8> {
    let mut uuid_field = [0u8; 16];
    let raw = uuid.as_bytes();
    let len = raw.len().min(uuid_field.len());
    uuid_field[..len].copy_from_slice(&raw[..len]);

    let nonce: [u8; 6] = rand::random();

    let mut body = Vec::with_capacity(16 + KEY_LENGTH + nonce.len());
    body.extend_from_slice(&uuid_field);
    body.extend_from_slice(local_key.as_bytes());
    body.extend_from_slice(&nonce);
    body
}

enum PairError {
    Rejected(u8),
    Malformed(FrameError),
}

/// `[status][session key]`, status 0 meaning accepted.
fn parse_pair_response(frame: &Frame) -> Result<SessionKey, PairError> {
    let (&status, rest) = frame
        .body
        .split_first()
        .ok_or(PairError::Malformed(FrameError::TooShort(0)))?;
    if status != 0 {
        return Err(PairError::Rejected(status));
    }
    let key: [u8; KEY_LENGTH] = rest
        .get(..KEY_LENGTH)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(PairError::Malformed(FrameError::TooShort(frame.body.len())))?;
    Ok(SessionKey::from_bytes(key))
}
