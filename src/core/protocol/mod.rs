//! Tuya BLE session codec
//! Pure framing, checksum, encryption and data point serialization. Nothing
//! in here performs I/O or keeps per-connection state besides the key it is
//! handed on every call.

mod crypto;
mod datapoint;
mod fragment;
mod frame;

pub use crypto::{BLOCK_SIZE, KEY_LENGTH, KeyLengthError, SessionKey};
pub use datapoint::{DataPoint, DpType, DpValue, decode_points, encode_points};
pub use fragment::{DEFAULT_MTU, FINAL_FLAG, MAX_CHUNKS, Reassembler, fragment};
pub use frame::{
    CHECKSUM_SIZE, Command, Frame, HEADER_SIZE, PROTOCOL_VERSION, SealedFrame, decode,
    decode_frame, encode, encode_frame,
};
