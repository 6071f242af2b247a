//! Polling orchestrator.
//!
//! Drives device sessions in scan, one-shot and continuous modes. Devices are
//! polled independently: one failure never stops the rest of the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use log::{debug, info, warn};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::{DeviceConfig, PollingConfig};
use crate::core::bluetooth::{BleTransport, DiscoveredDevice, ScanFilter};
use crate::core::error::TransportError;
use crate::core::profile::SensorProfile;
use crate::core::reading::PollOutcome;
use crate::core::session::{DeviceSession, SessionSettings};
use crate::publish::{PublishEvent, PublisherHandle};
use crate::utils::normalize_address;

/// Exponential delay, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// `base` with no failures, otherwise `min(base * 2^failures, cap)`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base;
        }
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Cross-cycle bookkeeping for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceHealth {
    pub consecutive_failures: u32,
    pub next_due: Option<Instant>,
}

impl DeviceHealth {
    fn is_due(&self, now: Instant) -> bool {
        self.next_due.map_or(true, |due| due <= now)
    }
}

pub struct Poller<T: BleTransport + ?Sized> {
    transport: Arc<T>,
    session: DeviceSession<T>,
    devices: Vec<DeviceConfig>,
    polling: PollingConfig,
    backoff: Backoff,
    health: HashMap<String, DeviceHealth>,
    publisher: Option<PublisherHandle>,
}

impl<T: BleTransport + ?Sized> Poller<T> {
    pub fn new(transport: Arc<T>, devices: Vec<DeviceConfig>, polling: PollingConfig) -> Self {
        Self::with_profile(transport, devices, polling, SensorProfile::default())
    }

    pub fn with_profile(
        transport: Arc<T>,
        devices: Vec<DeviceConfig>,
        polling: PollingConfig,
        profile: SensorProfile,
    ) -> Self {
        let session = DeviceSession::new(
            Arc::clone(&transport),
            SessionSettings::from_polling(&polling),
            profile,
        );
        let backoff = Backoff::new(polling.interval(), polling.max_backoff());
        Self {
            transport,
            session,
            devices,
            polling,
            backoff,
            health: HashMap::new(),
            publisher: None,
        }
    }

    /// Readings and availability changes go to `publisher`.
    pub fn with_publisher(mut self, publisher: PublisherHandle) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn health(&self, unique_id: &str) -> Option<&DeviceHealth> {
        self.health.get(unique_id)
    }

    /// Lists Tuya devices advertising within `duration`, one entry per
    /// address with the most recent signal strength.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        info!("Scanning for Tuya BLE devices for {:?}...", duration);
        let mut advertisements = self.transport.scan(&ScanFilter::tuya()).await?;
        let mut found: Vec<DiscoveredDevice> = Vec::new();

        let deadline = sleep(duration);
        tokio::pin!(deadline);

        loop {
            let device = tokio::select! {
                _ = &mut deadline => break,
                next = advertisements.next() => match next {
                    Some(device) => device,
                    None => break,
                },
            };

            let address = normalize_address(&device.address);
            match found.iter_mut().find(|d| d.address == address) {
                Some(known) => {
                    if device.rssi.is_some() {
                        known.rssi = device.rssi;
                    }
                    if known.name.is_none() {
                        known.name = device.name;
                    }
                }
                None => {
                    info!("Found {} ({:?}, RSSI {:?})", address, device.name, device.rssi);
                    found.push(DiscoveredDevice::new(address, device.name, device.rssi));
                }
            }
        }

        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Polls every configured device once, announcing the bridge for the
    /// duration of the cycle.
    pub async fn run_once(&mut self) -> Vec<PollOutcome> {
        let shutdown = CancellationToken::new();
        self.notify(PublishEvent::ProxyStatus { online: true });
        let outcomes = self.run_cycle(&shutdown, false).await;
        self.notify(PublishEvent::ProxyStatus { online: false });
        outcomes
    }

    /// Polls in cycles of `interval` until `shutdown` fires.
    ///
    /// Polls already running when the token fires are allowed to finish.
    pub async fn run_continuous(&mut self, shutdown: CancellationToken) {
        info!(
            "Polling {} device(s) every {:?}",
            self.devices.len(),
            self.polling.interval()
        );
        self.notify(PublishEvent::ProxyStatus { online: true });

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let outcomes = self.run_cycle(&shutdown, true).await;
            let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
            info!(
                "Cycle finished: {}/{} device(s) read in {:?}",
                succeeded,
                outcomes.len(),
                started.elapsed()
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_until(started + self.polling.interval()) => {}
            }
        }

        self.notify(PublishEvent::ProxyStatus { online: false });
        info!("Polling stopped");
    }

    async fn run_cycle(
        &mut self,
        shutdown: &CancellationToken,
        respect_backoff: bool,
    ) -> Vec<PollOutcome> {
        let cycle_start = Instant::now();
        let due: Vec<DeviceConfig> = self
            .devices
            .iter()
            .filter(|device| {
                let due = !respect_backoff
                    || self
                        .health
                        .get(&device.unique_id)
                        .map_or(true, |h| h.is_due(cycle_start));
                if !due {
                    debug!("{}: backing off, skipped this cycle", device.unique_id);
                }
                due
            })
            .cloned()
            .collect();

        let this = &*self;
        let polls: Vec<_> = due
            .iter()
            .map(|device| Box::pin(this.poll_device(device, shutdown)))
            .collect();
        let finished: Vec<Option<PollOutcome>> = stream::iter(polls)
            .buffer_unordered(this.polling.max_concurrent.max(1))
            .collect()
            .await;
        let outcomes: Vec<PollOutcome> = finished.into_iter().flatten().collect();

        for outcome in &outcomes {
            self.record(outcome, cycle_start);
        }
        outcomes
    }

    /// Polls one device with up to `retry_attempts` attempts. `None` when the
    /// shutdown fired before the first attempt started.
    async fn poll_device(
        &self,
        device: &DeviceConfig,
        shutdown: &CancellationToken,
    ) -> Option<PollOutcome> {
        let attempts = self.polling.retry_attempts.max(1);
        let mut last: Option<PollOutcome> = None;

        for attempt in 1..=attempts {
            if shutdown.is_cancelled() {
                break;
            }
            if attempt > 1 {
                info!(
                    "{}: retrying in {:?} (attempt {}/{})",
                    device.unique_id,
                    self.polling.retry_delay(),
                    attempt,
                    attempts
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(self.polling.retry_delay()) => {}
                }
            }

            let mut outcome = self.session.poll(device, self.polling.poll_timeout()).await;
            outcome.attempts = attempt;

            let inter_poll = self.polling.inter_poll_delay();
            if !inter_poll.is_zero() {
                sleep(inter_poll).await;
            }

            let retryable = outcome.failure().is_some_and(|f| f.is_retryable());
            last = Some(outcome);
            if !retryable {
                break;
            }
        }
        last
    }

    fn record(&mut self, outcome: &PollOutcome, cycle_start: Instant) {
        let health = self.health.entry(outcome.unique_id.clone()).or_default();

        match &outcome.result {
            Ok(reading) => {
                health.consecutive_failures = 0;
                health.next_due = Some(cycle_start + self.backoff.delay(0));
                self.notify(PublishEvent::Reading(reading.clone()));
                self.notify(PublishEvent::Availability {
                    unique_id: outcome.unique_id.clone(),
                    online: true,
                });
            }
            Err(failure) => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                let delay = self.backoff.delay(health.consecutive_failures);
                health.next_due = Some(cycle_start + delay);
                warn!(
                    "{}: {} failure after {} attempt(s), {} in a row; next try in {:?}",
                    outcome.unique_id,
                    failure.kind(),
                    outcome.attempts,
                    health.consecutive_failures,
                    delay
                );
                self.notify(PublishEvent::Availability {
                    unique_id: outcome.unique_id.clone(),
                    online: false,
                });
            }
        }
    }

    fn notify(&self, event: PublishEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.send(event);
        }
    }
}

/// Process exit status of a one-shot run: 1 when every polled device
/// failed, 0 otherwise (including when nothing was polled).
pub fn once_exit_code(outcomes: &[PollOutcome]) -> u8 {
    if !outcomes.is_empty() && outcomes.iter().all(|o| !o.is_success()) {
        1
    } else {
        0
    }
}
