//! Register value representation.
//!
//! The source connector passes around a dynamically-typed value
//! (`str | int | float | bool | Button | Switch | DateTime | None`).
//! Here that becomes a closed sum type; conversions to/from the wire
//! are total functions on it (spec §9, "Dynamic value types").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Unknown,
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    Float,
    String,
    Enum,
    Button,
    Switch,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonPayload {
    Pressed,
    Released,
    Clicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPayload {
    On,
    Off,
    Toggle,
}

/// A register value. Total across all `DataType` variants — there is no
/// "invalid value" state, only `Value::None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Button(ButtonPayload),
    Switch(SwitchPayload),
    DateTime(DateTime<Utc>),
    None,
}

impl Value {
    /// Number of wire bytes a value of the given data type occupies.
    /// `String` is variable length and not covered here; callers that need
    /// to size a read request for a `String` register use the device's
    /// advertised register length instead.
    pub fn fixed_width(data_type: DataType) -> Option<usize> {
        match data_type {
            DataType::Bool | DataType::U8 | DataType::I8 | DataType::Button | DataType::Switch => {
                Some(1)
            }
            DataType::U16 | DataType::I16 => Some(2),
            DataType::U32 | DataType::I32 | DataType::Float => Some(4),
            DataType::Enum => Some(1),
            DataType::Datetime => Some(4),
            DataType::String | DataType::Unknown => None,
        }
    }

    /// Decode a value from wire bytes for the given data type.
    ///
    /// Malformed or undersized input yields `Value::None` rather than an
    /// error — decoding failures are not propagated to callers (spec §7).
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Value {
        match data_type {
            DataType::Unknown => Value::None,
            DataType::Bool => bytes.first().map_or(Value::None, |b| Value::Bool(*b != 0)),
            DataType::U8 => bytes.first().map_or(Value::None, |b| Value::Int(*b as i64)),
            DataType::I8 => bytes
                .first()
                .map_or(Value::None, |b| Value::Int(*b as i8 as i64)),
            DataType::U16 => read_u32(bytes, 2).map_or(Value::None, |v| Value::Int(v as i64)),
            DataType::I16 => {
                read_u32(bytes, 2).map_or(Value::None, |v| Value::Int(v as u16 as i16 as i64))
            }
            DataType::U32 => read_u32(bytes, 4).map_or(Value::None, |v| Value::Int(v as i64)),
            DataType::I32 => read_u32(bytes, 4).map_or(Value::None, |v| Value::Int(v as i32 as i64)),
            DataType::Float => read_u32(bytes, 4)
                .map_or(Value::None, |bits| Value::Float(f32::from_bits(bits) as f64)),
            DataType::String => {
                String::from_utf8(bytes.to_vec()).map_or(Value::None, Value::Str)
            }
            DataType::Enum => bytes.first().map_or(Value::None, |b| Value::Int(*b as i64)),
            DataType::Button => match bytes.first() {
                Some(0) => Value::Button(ButtonPayload::Released),
                Some(1) => Value::Button(ButtonPayload::Pressed),
                Some(2) => Value::Button(ButtonPayload::Clicked),
                _ => Value::None,
            },
            DataType::Switch => match bytes.first() {
                Some(0) => Value::Switch(SwitchPayload::Off),
                Some(1) => Value::Switch(SwitchPayload::On),
                Some(2) => Value::Switch(SwitchPayload::Toggle),
                _ => Value::None,
            },
            DataType::Datetime => read_u32(bytes, 4).map_or(Value::None, |secs| {
                DateTime::<Utc>::from_timestamp(secs as i64, 0)
                    .map_or(Value::None, Value::DateTime)
            }),
        }
    }

    /// Encode a value to wire bytes for the given data type. Returns `None`
    /// when `self` cannot be represented as `data_type` (e.g. a `Str` value
    /// against a `Bool` register).
    pub fn encode(&self, data_type: DataType) -> Option<Vec<u8>> {
        match (self, data_type) {
            (Value::Bool(b), DataType::Bool) => Some(vec![*b as u8]),
            (Value::Int(v), DataType::U8) => Some(vec![*v as u8]),
            (Value::Int(v), DataType::I8) => Some(vec![*v as i8 as u8]),
            (Value::Int(v), DataType::U16) => Some((*v as u16).to_be_bytes().to_vec()),
            (Value::Int(v), DataType::I16) => Some((*v as i16).to_be_bytes().to_vec()),
            (Value::Int(v), DataType::U32) => Some((*v as u32).to_be_bytes().to_vec()),
            (Value::Int(v), DataType::I32) => Some((*v as i32).to_be_bytes().to_vec()),
            (Value::Int(v), DataType::Enum) => Some(vec![*v as u8]),
            (Value::Float(v), DataType::Float) => Some((*v as f32).to_bits().to_be_bytes().to_vec()),
            (Value::Str(s), DataType::String) => Some(s.as_bytes().to_vec()),
            (Value::Button(b), DataType::Button) => Some(vec![match b {
                ButtonPayload::Released => 0,
                ButtonPayload::Pressed => 1,
                ButtonPayload::Clicked => 2,
            }]),
            (Value::Switch(s), DataType::Switch) => Some(vec![match s {
                SwitchPayload::Off => 0,
                SwitchPayload::On => 1,
                SwitchPayload::Toggle => 2,
            }]),
            (Value::DateTime(dt), DataType::Datetime) => {
                Some((dt.timestamp() as u32).to_be_bytes().to_vec())
            }
            (Value::None, _) => None,
            _ => None,
        }
    }
}

fn read_u32(bytes: &[u8], width: usize) -> Option<u32> {
    if bytes.len() < width {
        return None;
    }
    let mut acc: u32 = 0;
    for b in &bytes[..width] {
        acc = (acc << 8) | (*b as u32);
    }
    Some(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_roundtrip() {
        let encoded = Value::Bool(true).encode(DataType::Bool).unwrap();
        assert_eq!(Value::decode(DataType::Bool, &encoded), Value::Bool(true));
    }

    #[test]
    fn u16_roundtrip() {
        let encoded = Value::Int(4660).encode(DataType::U16).unwrap();
        assert_eq!(encoded, vec![0x12, 0x34]);
        assert_eq!(Value::decode(DataType::U16, &encoded), Value::Int(4660));
    }

    #[test]
    fn i32_roundtrip_negative() {
        let encoded = Value::Int(-42).encode(DataType::I32).unwrap();
        assert_eq!(Value::decode(DataType::I32, &encoded), Value::Int(-42));
    }

    #[test]
    fn float_roundtrip() {
        let encoded = Value::Float(3.5).encode(DataType::Float).unwrap();
        assert_eq!(Value::decode(DataType::Float, &encoded), Value::Float(3.5));
    }

    #[test]
    fn string_roundtrip() {
        let encoded = Value::Str("abc".into()).encode(DataType::String).unwrap();
        assert_eq!(
            Value::decode(DataType::String, &encoded),
            Value::Str("abc".into())
        );
    }

    #[test]
    fn malformed_decode_yields_none() {
        assert_eq!(Value::decode(DataType::U32, &[0x01]), Value::None);
        assert_eq!(Value::decode(DataType::Unknown, &[0x01]), Value::None);
    }

    #[test]
    fn mismatched_encode_yields_none() {
        assert_eq!(Value::Str("x".into()).encode(DataType::Bool), None);
    }
}
