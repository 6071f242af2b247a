//! Tuya data points: `[id:1][type:1][len:2][value:len]`, big endian.

use serde::Serialize;

use crate::core::error::FrameError;

const DP_HEADER_SIZE: usize = 4;

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    Bool = 0x01,
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    Bitmap = 0x05,
}

impl TryFrom<u8> for DpType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(Self::Raw),
            0x01 => Ok(Self::Bool),
            0x02 => Ok(Self::Value),
            0x03 => Ok(Self::String),
            0x04 => Ok(Self::Enum),
            0x05 => Ok(Self::Bitmap),
            other => Err(FrameError::UnknownDataPointType(other)),
        }
    }
}

/// Typed value carried by a data point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DpValue {
    Raw(Vec<u8>),
    Bool(bool),
    Integer(i32),
    String(String),
    Enum(u8),
    Bitmap(u32),
}

impl DpValue {
    pub fn dp_type(&self) -> DpType {
        match self {
            DpValue::Raw(_) => DpType::Raw,
            DpValue::Bool(_) => DpType::Bool,
            DpValue::Integer(_) => DpType::Value,
            DpValue::String(_) => DpType::String,
            DpValue::Enum(_) => DpType::Enum,
            DpValue::Bitmap(_) => DpType::Bitmap,
        }
    }

    /// Integer view used when mapping data points onto metrics.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DpValue::Integer(v) => Some(i64::from(*v)),
            DpValue::Enum(v) => Some(i64::from(*v)),
            DpValue::Bool(v) => Some(i64::from(*v)),
            DpValue::Bitmap(v) => Some(i64::from(*v)),
            DpValue::Raw(_) | DpValue::String(_) => None,
        }
    }

    fn encode_value(&self) -> Vec<u8> {
        match self {
            DpValue::Raw(bytes) => bytes.clone(),
            DpValue::Bool(v) => vec![u8::from(*v)],
            DpValue::Integer(v) => v.to_be_bytes().to_vec(),
            DpValue::String(s) => s.as_bytes().to_vec(),
            DpValue::Enum(v) => vec![*v],
            DpValue::Bitmap(v) => v.to_be_bytes().to_vec(),
        }
    }

    fn decode_value(dp_type: DpType, data: &[u8]) -> Result<Self, FrameError> {
        let malformed = |what: &str| {
            FrameError::MalformedDataPoint(format!("{} with {} value bytes", what, data.len()))
        };
        match dp_type {
            DpType::Raw => Ok(DpValue::Raw(data.to_vec())),
            DpType::Bool => match data {
                [b] => Ok(DpValue::Bool(*b != 0)),
                _ => Err(malformed("bool")),
            },
            // Shorter integers are left padded with zeros.
            DpType::Value => match data.len() {
                1..=4 => {
                    let mut wide = [0u8; 4];
                    wide[4 - data.len()..].copy_from_slice(data);
                    Ok(DpValue::Integer(i32::from_be_bytes(wide)))
                }
                _ => Err(malformed("integer")),
            },
            DpType::String => String::from_utf8(data.to_vec())
                .map(DpValue::String)
                .map_err(|_| FrameError::MalformedDataPoint("string is not UTF-8".to_string())),
            DpType::Enum => match data {
                [b] => Ok(DpValue::Enum(*b)),
                _ => Err(malformed("enum")),
            },
            DpType::Bitmap => match data.len() {
                1 | 2 | 4 => Ok(DpValue::Bitmap(
                    data.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
                )),
                _ => Err(malformed("bitmap")),
            },
        }
    }
}

/// A single data point exchanged with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    pub id: u8,
    pub value: DpValue,
}

impl DataPoint {
    pub fn new(id: u8, value: DpValue) -> Self {
        Self { id, value }
    }
}

/// Serializes data points back to back.
pub fn encode_points(points: &[DataPoint]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    for point in points {
        let value = point.value.encode_value();
        let len = u16::try_from(value.len()).map_err(|_| FrameError::Oversized(value.len()))?;
        out.push(point.id);
        out.push(point.value.dp_type() as u8);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&value);
    }
    Ok(out)
}

/// Parses a payload made only of data points. Trailing garbage is an error.
pub fn decode_points(mut data: &[u8]) -> Result<Vec<DataPoint>, FrameError> {
    let mut points = Vec::new();
    while !data.is_empty() {
        if data.len() < DP_HEADER_SIZE {
            return Err(FrameError::MalformedDataPoint(format!(
                "truncated header ({} bytes left)",
                data.len()
            )));
        }
        let id = data[0];
        let dp_type = DpType::try_from(data[1])?;
        let len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let rest = &data[DP_HEADER_SIZE..];
        if rest.len() < len {
            return Err(FrameError::MalformedDataPoint(format!(
                "dp {} declares {} bytes, {} available",
                id,
                len,
                rest.len()
            )));
        }
        points.push(DataPoint::new(id, DpValue::decode_value(dp_type, &rest[..len])?));
        data = &rest[len..];
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poke_point_matches_known_bytes() {
        let bytes = encode_points(&[DataPoint::new(9, DpValue::Enum(0))]).unwrap();
        assert_eq!(bytes, vec![0x09, 0x04, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn every_type_survives_encoding() {
        let points = vec![
            DataPoint::new(1, DpValue::Raw(vec![0xde, 0xad])),
            DataPoint::new(2, DpValue::Bool(true)),
            DataPoint::new(3, DpValue::Integer(-225)),
            DataPoint::new(4, DpValue::String("sgs01".into())),
            DataPoint::new(14, DpValue::Enum(2)),
            DataPoint::new(20, DpValue::Bitmap(0x0102_0304)),
        ];
        assert_eq!(decode_points(&encode_points(&points).unwrap()).unwrap(), points);
    }

    #[test]
    fn short_bitmaps_are_widened() {
        let points = decode_points(&[0x05, 0x05, 0x00, 0x02, 0x01, 0x02]).unwrap();
        assert_eq!(points, vec![DataPoint::new(5, DpValue::Bitmap(0x0102))]);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let result = decode_points(&[0x01, 0x09, 0x00, 0x00]);
        assert_eq!(result, Err(FrameError::UnknownDataPointType(0x09)));
    }

    #[test]
    fn truncated_value_is_rejected() {
        let result = decode_points(&[0x03, 0x02, 0x00, 0x04, 0x00, 0x00]);
        assert!(matches!(result, Err(FrameError::MalformedDataPoint(_))));
    }

    #[test]
    fn short_integers_are_widened() {
        let points = decode_points(&[0x04, 0x02, 0x00, 0x01, 0x2d]).unwrap();
        assert_eq!(points, vec![DataPoint::new(4, DpValue::Integer(45))]);

        let points = decode_points(&[0x03, 0x02, 0x00, 0x02, 0x00, 0xe1]).unwrap();
        assert_eq!(points, vec![DataPoint::new(3, DpValue::Integer(225))]);

        let points = decode_points(&[0x03, 0x02, 0x00, 0x02, 0xff, 0xff]).unwrap();
        assert_eq!(points, vec![DataPoint::new(3, DpValue::Integer(0xffff))]);
    }

    #[test]
    fn integer_with_wrong_width_is_rejected() {
        let empty = decode_points(&[0x03, 0x02, 0x00, 0x00]);
        assert!(matches!(empty, Err(FrameError::MalformedDataPoint(_))));

        let wide = decode_points(&[0x03, 0x02, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0xe1]);
        assert!(matches!(wide, Err(FrameError::MalformedDataPoint(_))));
    }

    #[test]
    fn oversized_value_is_an_error() {
        let huge = DataPoint::new(1, DpValue::Raw(vec![0; 70_000]));
        assert_eq!(encode_points(&[huge]), Err(FrameError::Oversized(70_000)));
    }

    #[test]
    fn dangling_header_bytes_are_rejected() {
        let mut bytes = encode_points(&[DataPoint::new(4, DpValue::Integer(45))]).unwrap();
        bytes.extend_from_slice(&[0x0f, 0x02]);
        assert!(decode_points(&bytes).is_err());
    }
}
