//! Constants used throughout the application
//! GATT UUIDs of the Tuya BLE service and the timeouts used when talking to
//! the platform Bluetooth stack.

use uuid::Uuid;

/// Advertised service of Tuya BLE devices
pub const UUID_TUYA_SERVICE: Uuid = Uuid::from_u128(0x00001910_0000_1000_8000_00805f9b34fb);

/// Characteristic the host writes frames to
pub const UUID_TUYA_WRITE_CHAR: Uuid = Uuid::from_u128(0x00002b11_0000_1000_8000_00805f9b34fb);

/// Characteristic the device notifies frames on
pub const UUID_TUYA_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x00002b10_0000_1000_8000_00805f9b34fb);

/// How long to scan for a configured address before giving up
pub const DEVICE_LOOKUP_TIMEOUT_SECS: u64 = 10;

/// Upper bound for tearing down a connection
pub const DISCONNECT_TIMEOUT_SECS: u64 = 5;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 15;

/// Buffered notification chunks per connection
pub const NOTIFICATION_BUFFER: usize = 64;
