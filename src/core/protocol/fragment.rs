//! Splitting frames into MTU sized characteristic writes and joining
//! notification chunks back into frames.
//!
//! Every chunk starts with a marker byte: the low 7 bits carry the chunk
//! index, the high bit flags the final chunk of a frame.

use log::debug;

use crate::core::error::FrameError;

pub const FINAL_FLAG: u8 = 0x80;
pub const INDEX_MASK: u8 = 0x7F;
pub const MAX_CHUNKS: usize = 128;

/// Default usable ATT payload (23 byte ATT MTU minus 3 bytes of overhead).
pub const DEFAULT_MTU: usize = 20;

/// Splits `frame` into chunks of at most `mtu` bytes including the marker.
pub fn fragment(frame: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    if mtu < 2 {
        return Err(FrameError::Reassembly(format!("MTU {} leaves no room for data", mtu)));
    }
    let per_chunk = mtu - 1;
    let total = frame.len().div_ceil(per_chunk).max(1);
    if total > MAX_CHUNKS {
        return Err(FrameError::Reassembly(format!(
            "frame of {} bytes needs {} chunks (max {})",
            frame.len(),
            total,
            MAX_CHUNKS
        )));
    }

    let mut chunks = Vec::with_capacity(total);
    if frame.is_empty() {
        chunks.push(vec![FINAL_FLAG]);
        return Ok(chunks);
    }
    for (index, data) in frame.chunks(per_chunk).enumerate() {
        let mut marker = index as u8;
        if index + 1 == total {
            marker |= FINAL_FLAG;
        }
        let mut chunk = Vec::with_capacity(data.len() + 1);
        chunk.push(marker);
        chunk.extend_from_slice(data);
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Incremental reassembly of inbound notification chunks.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    next_index: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk. Returns the complete frame once the final chunk
    /// arrives. A gap or reordering drops the partial frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let Some((&marker, data)) = chunk.split_first() else {
            return Err(FrameError::Reassembly("empty chunk".to_string()));
        };
        let index = marker & INDEX_MASK;
        let is_final = marker & FINAL_FLAG != 0;

        if index == 0 {
            if self.next_index.is_some() {
                debug!("Discarding partial frame of {} bytes", self.buffer.len());
            }
            self.buffer.clear();
        } else {
            match self.next_index {
                Some(expected) if expected == index => {}
                Some(expected) => {
                    self.reset();
                    return Err(FrameError::Reassembly(format!(
                        "expected chunk {}, got {}",
                        expected, index
                    )));
                }
                None => {
                    return Err(FrameError::Reassembly(format!(
                        "chunk {} without a preceding first chunk",
                        index
                    )));
                }
            }
        }

        self.buffer.extend_from_slice(data);
        if is_final {
            self.next_index = None;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        if usize::from(index) + 1 >= MAX_CHUNKS {
            self.reset();
            return Err(FrameError::Reassembly("too many chunks".to_string()));
        }
        self.next_index = Some(index + 1);
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::crypto::SessionKey;
    use crate::core::protocol::datapoint::{DataPoint, DpValue};
    use crate::core::protocol::frame::{self, Command};

    fn sensor_frame() -> Vec<u8> {
        let points = [
            DataPoint::new(4, DpValue::Integer(45)),
            DataPoint::new(3, DpValue::Integer(225)),
            DataPoint::new(15, DpValue::Integer(87)),
        ];
        frame::encode(
            Command::DpReport,
            5,
            &points,
            &SessionKey::from_local_key("0123456789abcdef"),
        )
        .unwrap()
    }

    fn reassemble(chunks: &[Vec<u8>]) -> Result<Option<Vec<u8>>, FrameError> {
        let mut reassembler = Reassembler::new();
        let mut last = Ok(None);
        for chunk in chunks {
            last = reassembler.push(chunk);
            if last.is_err() {
                break;
            }
        }
        last
    }

    #[test]
    fn three_chunk_frame_reassembles_identically() {
        let frame = sensor_frame();
        let chunks = fragment(&frame, DEFAULT_MTU).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0][0], 0x00);
        assert_eq!(chunks[1][0], 0x01);
        assert_eq!(chunks[2][0], 0x02 | FINAL_FLAG);
        assert!(chunks.iter().all(|c| c.len() <= DEFAULT_MTU));
        assert_eq!(reassemble(&chunks).unwrap(), Some(frame));
    }

    #[test]
    fn missing_middle_chunk_fails() {
        let chunks = fragment(&sensor_frame(), DEFAULT_MTU).unwrap();
        let gapped = vec![chunks[0].clone(), chunks[2].clone()];
        assert!(matches!(reassemble(&gapped), Err(FrameError::Reassembly(_))));
    }

    #[test]
    fn out_of_order_chunks_fail() {
        let chunks = fragment(&sensor_frame(), DEFAULT_MTU).unwrap();
        let shuffled = vec![chunks[1].clone(), chunks[0].clone(), chunks[2].clone()];
        assert!(matches!(reassemble(&shuffled), Err(FrameError::Reassembly(_))));
    }

    #[test]
    fn a_new_first_chunk_restarts_reassembly() {
        let frame = sensor_frame();
        let chunks = fragment(&frame, DEFAULT_MTU).unwrap();
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&chunks[0]).unwrap(), None);
        for chunk in &chunks[..2] {
            assert_eq!(reassembler.push(chunk).unwrap(), None);
        }
        assert_eq!(reassembler.push(&chunks[2]).unwrap(), Some(frame));
    }

    #[test]
    fn small_frame_fits_a_single_final_chunk() {
        let chunks = fragment(&[1, 2, 3], DEFAULT_MTU).unwrap();
        assert_eq!(chunks, vec![vec![FINAL_FLAG, 1, 2, 3]]);
    }

    #[test]
    fn oversized_frames_are_refused() {
        let data = vec![0u8; MAX_CHUNKS * 19 + 1];
        assert!(fragment(&data, DEFAULT_MTU).is_err());
    }

    #[test]
    fn empty_chunk_is_an_error() {
        assert!(Reassembler::new().push(&[]).is_err());
    }
}
