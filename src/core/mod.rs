//! Core functionality for the Tuya BLE bridge
//! Wire protocol, device sessions and the polling orchestrator, plus the
//! Bluetooth transport they run on.

pub mod bluetooth;
pub mod error;
pub mod poller;
pub mod profile;
pub mod protocol;
pub mod reading;
pub mod session;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use error::{FrameError, PollFailure, PublishError, TransportError};
pub use poller::{Backoff, DeviceHealth, Poller, once_exit_code};
pub use profile::{MetricKind, MetricSpec, SensorProfile};
pub use reading::{MetricValue, PollOutcome, Reading};
pub use session::{DeviceSession, SessionPhase, SessionSettings};
