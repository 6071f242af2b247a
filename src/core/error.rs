//! Error types shared by the protocol, session and publishing layers.

use std::time::Duration;

use thiserror::Error;

use crate::core::session::SessionPhase;

/// A received frame (or chunk sequence) that cannot be used.
///
/// Always recoverable: the caller discards the frame and keeps waiting or
/// re-issues the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("Declared payload length {declared} does not match received {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },
    #[error("Unknown command code: {0:#04x}")]
    UnknownCommand(u8),
    #[error("Invalid block padding")]
    InvalidPadding,
    #[error("Unknown data point type tag: {0:#04x}")]
    UnknownDataPointType(u8),
    #[error("Malformed data point: {0}")]
    MalformedDataPoint(String),
    #[error("Reassembly error: {0}")]
    Reassembly(String),
    #[error("{0} bytes do not fit a 16 bit length field")]
    Oversized(usize),
}

/// Adapter or connection level failure reported by a [`BleTransport`].
///
/// [`BleTransport`]: crate::core::bluetooth::BleTransport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Connection refused by {address}: {reason}")]
    ConnectionRefused { address: String, reason: String },
    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Notification subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Device disconnected")]
    Disconnected,
    #[error("Bluetooth error: {0}")]
    Backend(String),
}

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Why a single poll of one device did not produce a reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Timed out while {phase} (budget {budget:?})")]
    Timeout { phase: SessionPhase, budget: Duration },
    #[error("Device rejected the local key: {0}")]
    Auth(String),
    #[error("Protocol failure after {retries} retries: {last}")]
    Protocol { retries: u32, last: FrameError },
}

impl PollFailure {
    /// Short label used in log lines and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PollFailure::Transport(_) => "transport",
            PollFailure::Timeout { .. } => "timeout",
            PollFailure::Auth(_) => "auth",
            PollFailure::Protocol { .. } => "protocol",
        }
    }

    /// Auth failures are configuration errors; retrying them is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PollFailure::Auth(_))
    }
}

/// The bus rejected or could not carry a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("Broker client error: {0}")]
    Client(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}
