//! Frame layout (big endian):
//!
//! ```text
//! [version:1][seq:2][command:1][len:2][ciphertext:len][crc16:2]
//! ```
//!
//! The CRC covers the header and the ciphertext, so a frame can be rejected
//! before any decryption is attempted.

use crc::{CRC_16_IBM_3740, Crc};

use crate::core::error::FrameError;
use crate::core::protocol::crypto::{self, SessionKey};
use crate::core::protocol::datapoint::{self, DataPoint};

/// Protocol version byte written into every frame.
pub const PROTOCOL_VERSION: u8 = 0x03;

pub const HEADER_SIZE: usize = 6;
pub const CHECKSUM_SIZE: usize = 2;

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Tuya BLE command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    PairRequest = 0x01,
    PairResponse = 0x02,
    DeviceInfoRequest = 0x03,
    DeviceInfoResponse = 0x04,
    DpWrite = 0x06,
    DpReport = 0x07,
    DpQuery = 0x08,
    TimeSync = 0x0D,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Self::PairRequest),
            0x02 => Ok(Self::PairResponse),
            0x03 => Ok(Self::DeviceInfoRequest),
            0x04 => Ok(Self::DeviceInfoResponse),
            0x06 => Ok(Self::DpWrite),
            0x07 => Ok(Self::DpReport),
            0x08 => Ok(Self::DpQuery),
            0x0D => Ok(Self::TimeSync),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// A decrypted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub seq: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, seq: u16, body: Vec<u8>) -> Self {
        Self { command, seq, body }
    }

    /// Interprets the body as a list of data points.
    pub fn data_points(&self) -> Result<Vec<DataPoint>, FrameError> {
        datapoint::decode_points(&self.body)
    }
}

/// A frame whose header and checksum have been validated but whose payload
/// is still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    pub command: Command,
    pub seq: u16,
    ciphertext: Vec<u8>,
}

impl SealedFrame {
    /// Validates version, declared length, checksum and command code.
    pub fn open(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(bytes[0]));
        }

        let declared = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        let actual = bytes.len() - HEADER_SIZE - CHECKSUM_SIZE;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let (covered, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let expected = u16::from_be_bytes([trailer[0], trailer[1]]);
        let computed = CRC16.checksum(covered);
        if expected != computed {
            return Err(FrameError::ChecksumMismatch { expected, computed });
        }

        Ok(Self {
            command: Command::try_from(bytes[3])?,
            seq: u16::from_be_bytes([bytes[1], bytes[2]]),
            ciphertext: covered[HEADER_SIZE..].to_vec(),
        })
    }

    pub fn decrypt(self, key: &SessionKey) -> Result<Frame, FrameError> {
        let body = crypto::decrypt(&self.ciphertext, key)?;
        Ok(Frame::new(self.command, self.seq, body))
    }
}

/// Encrypts the body and assembles a complete frame.
pub fn encode_frame(frame: &Frame, key: &SessionKey) -> Result<Vec<u8>, FrameError> {
    let ciphertext = crypto::encrypt(&frame.body, key);
    let len = u16::try_from(ciphertext.len())
        .map_err(|_| FrameError::Oversized(ciphertext.len()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len() + CHECKSUM_SIZE);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&frame.seq.to_be_bytes());
    out.push(frame.command as u8);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    let crc = CRC16.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Validates and decrypts a complete frame.
pub fn decode_frame(bytes: &[u8], key: &SessionKey) -> Result<Frame, FrameError> {
    SealedFrame::open(bytes)?.decrypt(key)
}

/// Builds a frame carrying data points.
pub fn encode(
    command: Command,
    seq: u16,
    points: &[DataPoint],
    key: &SessionKey,
) -> Result<Vec<u8>, FrameError> {
    let body = datapoint::encode_points(points)?;
    encode_frame(&Frame::new(command, seq, body), key)
}

/// Parses a frame carrying data points.
pub fn decode(
    bytes: &[u8],
    key: &SessionKey,
) -> Result<(Command, u16, Vec<DataPoint>), FrameError> {
    let frame = decode_frame(bytes, key)?;
    let points = frame.data_points()?;
    Ok((frame.command, frame.seq, points))
}
