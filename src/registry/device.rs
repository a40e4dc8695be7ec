//! Device record (spec §3).

use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::wire::UNASSIGNED_ADDRESS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Unknown,
    Init,
    Pairing,
    Ready,
    Lost,
    Stopped,
}

/// Capability/descriptor fields captured once, at pairing time.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub serial_number: String,
    pub hardware_version: String,
    pub hardware_model: String,
    pub hardware_manufacturer: String,
    pub firmware_version: String,
    pub firmware_manufacturer: String,
    pub pub_sub_pub_support: bool,
    pub pub_sub_sub_support: bool,
    pub max_subscriptions: u8,
    pub max_subscription_conditions: u8,
    pub max_subscription_actions: u8,
    pub input_registers_size: u8,
    pub output_registers_size: u8,
    pub attributes_registers_size: u8,
    pub settings_registers_size: u8,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub address: u8,
    pub descriptor: DeviceDescriptor,
    pub state: ConnectionState,
    pub last_packet_sent_at: Option<Instant>,
    pub ready_for_reply: bool,
    pub sampling_period: Duration,
}

impl DeviceDescriptor {
    /// Encode for the DISCOVER/SEARCH reply body (spec §4.6 phase 1):
    /// length-prefixed ASCII strings followed by the fixed capability bytes,
    /// in field-declaration order. The wire shape for this payload is not
    /// pinned down by the protocol table in spec §6 (only the sub-command
    /// bytes are); this layout is this crate's own choice, used
    /// symmetrically by `decode`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in [
            &self.serial_number,
            &self.hardware_version,
            &self.hardware_model,
            &self.hardware_manufacturer,
            &self.firmware_version,
            &self.firmware_manufacturer,
        ] {
            out.push(field.len().min(255) as u8);
            out.extend_from_slice(field.as_bytes());
        }
        out.push(self.pub_sub_pub_support as u8);
        out.push(self.pub_sub_sub_support as u8);
        out.push(self.max_subscriptions);
        out.push(self.max_subscription_conditions);
        out.push(self.max_subscription_actions);
        out.push(self.input_registers_size);
        out.push(self.output_registers_size);
        out.push(self.attributes_registers_size);
        out.push(self.settings_registers_size);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cursor = 0usize;
        let mut read_string = |bytes: &[u8], cursor: &mut usize| -> Option<String> {
            let len = *bytes.get(*cursor)? as usize;
            *cursor += 1;
            let s = bytes.get(*cursor..*cursor + len)?;
            *cursor += len;
            String::from_utf8(s.to_vec()).ok()
        };

        let serial_number = read_string(bytes, &mut cursor)?;
        let hardware_version = read_string(bytes, &mut cursor)?;
        let hardware_model = read_string(bytes, &mut cursor)?;
        let hardware_manufacturer = read_string(bytes, &mut cursor)?;
        let firmware_version = read_string(bytes, &mut cursor)?;
        let firmware_manufacturer = read_string(bytes, &mut cursor)?;

        let tail = bytes.get(cursor..cursor + 9)?;
        Some(Self {
            serial_number,
            hardware_version,
            hardware_model,
            hardware_manufacturer,
            firmware_version,
            firmware_manufacturer,
            pub_sub_pub_support: tail[0] != 0,
            pub_sub_sub_support: tail[1] != 0,
            max_subscriptions: tail[2],
            max_subscription_conditions: tail[3],
            max_subscription_actions: tail[4],
            input_registers_size: tail[5],
            output_registers_size: tail[6],
            attributes_registers_size: tail[7],
            settings_registers_size: tail[8],
        })
    }
}

impl Device {
    pub fn new(id: Uuid, address: u8, descriptor: DeviceDescriptor) -> Self {
        Self {
            id,
            address,
            descriptor,
            state: ConnectionState::Unknown,
            last_packet_sent_at: None,
            ready_for_reply: false,
            sampling_period: Duration::from_secs(30),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.address != UNASSIGNED_ADDRESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let descriptor = DeviceDescriptor {
            serial_number: "ABC12345".into(),
            hardware_version: "1.2".into(),
            hardware_model: "mk2".into(),
            hardware_manufacturer: "acme".into(),
            firmware_version: "0.9".into(),
            firmware_manufacturer: "acme-fw".into(),
            pub_sub_pub_support: true,
            pub_sub_sub_support: false,
            max_subscriptions: 4,
            max_subscription_conditions: 2,
            max_subscription_actions: 1,
            input_registers_size: 2,
            output_registers_size: 1,
            attributes_registers_size: 1,
            settings_registers_size: 0,
        };

        let encoded = descriptor.encode();
        let decoded = DeviceDescriptor::decode(&encoded).unwrap();
        assert_eq!(decoded.serial_number, descriptor.serial_number);
        assert_eq!(decoded.input_registers_size, 2);
        assert_eq!(decoded.output_registers_size, 1);
        assert_eq!(decoded.attributes_registers_size, 1);
        assert!(decoded.pub_sub_pub_support);
        assert!(!decoded.pub_sub_sub_support);
    }
}
