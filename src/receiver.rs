//! Inbound frame dispatch (spec §4.4).
//!
//! The receiver never talks to the link directly; the connector hands it
//! whatever `Link::take_received()` produced. Frame validation happens here,
//! once, before any packet-kind-specific decoding — a bad frame is logged
//! and dropped, never handed further down (spec §4.1, §7).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::frame;
use crate::link::LinkFrame;
use crate::pairing::Pairing;
use crate::registry::{ConnectionState, Registry};
use crate::value::{DataType, Value};
use crate::wire::{DiscoverCommand, PacketKind, RegisterKind};

/// Default number of consecutive missed replies before a device is
/// declared LOST (spec §4.4).
pub const DEFAULT_MAX_MISSES: u32 = 5;

/// What kind of reply an outstanding request is waiting for. Used only to
/// decide whether an inbound frame actually answers the watchdog entry it
/// is matched against; the registry update itself is driven by the inbound
/// packet kind regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitedKind {
    Pong,
    ReadReply,
    WriteReply,
}

struct WatchdogEntry {
    #[allow(dead_code)]
    awaited: AwaitedKind,
    deadline: Instant,
}

/// Dispatches inbound frames and tracks the reply-watchdog (spec §4.4).
pub struct Receiver {
    inbound: VecDeque<LinkFrame>,
    watchdogs: HashMap<Uuid, WatchdogEntry>,
    misses: HashMap<Uuid, u32>,
    max_misses: u32,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSES)
    }
}

impl Receiver {
    pub fn new(max_misses: u32) -> Self {
        Self {
            inbound: VecDeque::new(),
            watchdogs: HashMap::new(),
            misses: HashMap::new(),
            max_misses,
        }
    }

    pub fn push_inbound(&mut self, frame: LinkFrame) {
        self.inbound.push_back(frame);
    }

    /// Used by `Connector::has_unfinished_tasks` (spec §4.7).
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    /// Called by the Publisher after sending a non-broadcast request (spec
    /// §4.4: "every outbound non-broadcast request records (device,
    /// awaited_kind, deadline)").
    pub fn record_request(&mut self, device_id: Uuid, awaited: AwaitedKind, deadline: Instant) {
        self.watchdogs.insert(device_id, WatchdogEntry { awaited, deadline });
    }

    fn clear_watchdog(&mut self, device_id: Uuid) {
        self.watchdogs.remove(&device_id);
        self.misses.remove(&device_id);
    }

    /// One tick: expire overdue watchdog entries, then drain and dispatch
    /// whatever frames are queued.
    pub fn loop_tick(
        &mut self,
        registry: &mut Registry,
        pairing: &mut Pairing,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) {
        self.expire_watchdogs(registry, now);

        while let Some(frame) = self.inbound.pop_front() {
            self.dispatch(frame, registry, pairing, now, now_utc);
        }
    }

    fn expire_watchdogs(&mut self, registry: &mut Registry, now: Instant) {
        let expired: Vec<Uuid> = self
            .watchdogs
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for device_id in expired {
            self.watchdogs.remove(&device_id);
            let misses = self.misses.entry(device_id).or_insert(0);
            *misses += 1;
            tracing::debug!(%device_id, misses = *misses, "reply watchdog miss");

            if *misses >= self.max_misses {
                tracing::warn!(%device_id, "device declared LOST after {} missed replies", self.max_misses);
                if let Err(err) = registry.set_state(device_id, ConnectionState::Lost) {
                    tracing::warn!(%device_id, %err, "failed to mark device LOST");
                }
                self.misses.remove(&device_id);
            }
        }
    }

    fn dispatch(
        &mut self,
        frame: LinkFrame,
        registry: &mut Registry,
        pairing: &mut Pairing,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) {
        let payload = match frame::decode(&frame.bytes) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "dropping invalid inbound frame");
                return;
            }
        };

        // payload[0] = version (already validated), payload[1] = packet kind.
        let kind = match PacketKind::try_from(payload[1]) {
            Ok(k) => k,
            Err(_) => return, // already validated by frame::decode; unreachable in practice
        };
        let body = &payload[2..];

        match kind {
            PacketKind::Ping | PacketKind::Pong => self.handle_liveness(frame.sender_address, registry),
            PacketKind::ReadSingleRegister | PacketKind::ReadMultipleRegisters => {
                self.handle_register_reply(frame.sender_address, body, registry, now_utc)
            }
            PacketKind::WriteSingleRegister => {
                self.handle_register_reply(frame.sender_address, body, registry, now_utc)
            }
            PacketKind::ReportSingleRegister => {
                self.handle_unsolicited_report(frame.sender_address, body, registry, now_utc)
            }
            PacketKind::Discover => self.handle_discover_reply(frame.sender_address, body, pairing, now),
            PacketKind::PubSub(code) => {
                tracing::debug!(code, "ignoring pub-sub frame (optional capability, not implemented)")
            }
            PacketKind::Exception => self.handle_exception(frame.sender_address, registry),
        }
    }

    fn handle_liveness(&mut self, sender_address: Option<u8>, registry: &mut Registry) {
        let Some(device) = sender_address.and_then(|a| registry.get_device_by_address(a)) else {
            return;
        };
        let device_id = device.id;
        self.clear_watchdog(device_id);

        if device.state == ConnectionState::Lost {
            if let Err(err) = registry.set_state(device_id, ConnectionState::Ready) {
                tracing::warn!(%device_id, %err, "failed to revive device on liveness reply");
            }
        }
    }

    fn handle_exception(&mut self, sender_address: Option<u8>, registry: &mut Registry) {
        let Some(device_id) = sender_address.and_then(|a| registry.get_device_by_address(a)).map(|d| d.id) else {
            return;
        };
        tracing::warn!(%device_id, "device reported EXCEPTION");
        self.clear_watchdog(device_id);
        if let Err(err) = registry.set_state(device_id, ConnectionState::Lost) {
            tracing::warn!(%device_id, %err, "failed to mark device LOST after exception");
        }
    }

    /// Decode a `(register_kind, address, value...)` reply body and apply it
    /// to the registry. Shared by READ_SINGLE_REGISTER, READ_MULTIPLE_REGISTERS
    /// and WRITE_SINGLE_REGISTER replies, which all carry the observed actual
    /// value in the same shape (spec §4.4; byte layout is an implementation
    /// choice left open by the spec — see DESIGN.md).
    fn handle_register_reply(
        &mut self,
        sender_address: Option<u8>,
        body: &[u8],
        registry: &mut Registry,
        now_utc: DateTime<Utc>,
    ) {
        let Some(device_id) = sender_address.and_then(|a| registry.get_device_by_address(a)).map(|d| d.id) else {
            return;
        };
        self.clear_watchdog(device_id);
        self.apply_register_values(device_id, body, registry, now_utc);
    }

    fn handle_unsolicited_report(
        &mut self,
        sender_address: Option<u8>,
        body: &[u8],
        registry: &mut Registry,
        now_utc: DateTime<Utc>,
    ) {
        let Some(device_id) = sender_address.and_then(|a| registry.get_device_by_address(a)).map(|d| d.id) else {
            return;
        };
        self.apply_register_values(device_id, body, registry, now_utc);
    }

    fn apply_register_values(
        &self,
        device_id: Uuid,
        body: &[u8],
        registry: &mut Registry,
        now_utc: DateTime<Utc>,
    ) {
        let [kind_byte, address, rest @ ..] = body else {
            tracing::warn!(%device_id, "register reply too short, dropping");
            return;
        };
        let Ok(kind) = RegisterKind::try_from(*kind_byte) else {
            tracing::warn!(%device_id, byte = *kind_byte, "unknown register kind in reply, dropping");
            return;
        };
        let Some(register) = registry.get_register_by_address(device_id, kind, *address) else {
            tracing::debug!(%device_id, ?kind, address, "reply for unknown register, dropping");
            return;
        };
        let register_id = register.id;
        let data_type = register.data_type;

        let value = decode_reply_value(data_type, rest);
        if let Err(err) = registry.set_actual_value(register_id, value, now_utc) {
            tracing::warn!(%register_id, %err, "failed to apply register reply");
        }
    }

    fn handle_discover_reply(
        &mut self,
        sender_address: Option<u8>,
        body: &[u8],
        pairing: &mut Pairing,
        now: Instant,
    ) {
        let Some((&cmd_byte, rest)) = body.split_first() else {
            tracing::warn!("empty DISCOVER reply body, dropping");
            return;
        };
        let Some(cmd) = DiscoverCommand::from_response_byte(cmd_byte) else {
            tracing::warn!(byte = cmd_byte, "unrecognised DISCOVER response code, dropping");
            return;
        };
        pairing.on_reply(cmd, sender_address, rest, now);
    }
}

/// One reply value, `DataType::String` falls back to consuming whatever
/// bytes remain (used by READ_SINGLE_REGISTER where the device sends its
/// whole string in one frame). Fixed-width types read exactly their width;
/// undersized input decodes to `Value::None` (spec §7 — malformed data is
/// dropped, not propagated as an error).
fn decode_reply_value(data_type: DataType, bytes: &[u8]) -> Value {
    Value::decode(data_type, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::pairing::PairingConfig;
    use crate::registry::DeviceDescriptor;
    use crate::registry::register::Register;

    fn descriptor(serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            serial_number: serial.to_string(),
            hardware_version: "1.0".into(),
            hardware_model: "m".into(),
            hardware_manufacturer: "acme".into(),
            firmware_version: "1.0".into(),
            firmware_manufacturer: "acme".into(),
            pub_sub_pub_support: false,
            pub_sub_sub_support: false,
            max_subscriptions: 0,
            max_subscription_conditions: 0,
            max_subscription_actions: 0,
            input_registers_size: 0,
            output_registers_size: 0,
            attributes_registers_size: 0,
            settings_registers_size: 0,
        }
    }

    fn frame_bytes(kind: PacketKind, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x01, kind.byte()];
        payload.extend_from_slice(body);
        frame::encode(&payload)
    }

    #[test]
    fn five_consecutive_misses_declares_device_lost() {
        let mut receiver = Receiver::new(5);
        let mut registry = Registry::new();
        let mut pairing = Pairing::new(PairingConfig::default());
        let device_id = registry.append_device(Uuid::new_v4(), 1, descriptor("dev"));
        registry.set_state(device_id, ConnectionState::Ready).unwrap();

        let base = Instant::now();
        for i in 0..5 {
            receiver.record_request(device_id, AwaitedKind::Pong, base);
            receiver.loop_tick(&mut registry, &mut pairing, base + Duration::from_millis(1), Utc::now());
            if i < 4 {
                assert_ne!(registry.get_device_by_id(device_id).unwrap().state, ConnectionState::Lost);
            }
        }
        assert_eq!(registry.get_device_by_id(device_id).unwrap().state, ConnectionState::Lost);
    }

    #[test]
    fn pong_revives_lost_device_and_clears_watchdog() {
        let mut receiver = Receiver::new(5);
        let mut registry = Registry::new();
        let mut pairing = Pairing::new(PairingConfig::default());
        let device_id = registry.append_device(Uuid::new_v4(), 7, descriptor("dev"));
        registry.set_state(device_id, ConnectionState::Lost).unwrap();

        let frame_bytes = frame_bytes(PacketKind::Pong, &[]);
        receiver.push_inbound(LinkFrame { sender_address: Some(7), bytes: frame_bytes });
        receiver.loop_tick(&mut registry, &mut pairing, Instant::now(), Utc::now());

        assert_eq!(registry.get_device_by_id(device_id).unwrap().state, ConnectionState::Ready);
    }

    #[test]
    fn read_reply_updates_actual_value() {
        let mut receiver = Receiver::new(5);
        let mut registry = Registry::new();
        let mut pairing = Pairing::new(PairingConfig::default());
        let device_id = registry.append_device(Uuid::new_v4(), 3, descriptor("dev"));
        let register_id = registry.upsert_register(Register::new_input(Uuid::new_v4(), device_id, 0, DataType::U8));

        let body = [RegisterKind::Input.byte(), 0, 0x2A];
        let bytes = frame_bytes(PacketKind::ReadSingleRegister, &body);
        receiver.push_inbound(LinkFrame { sender_address: Some(3), bytes });
        receiver.loop_tick(&mut registry, &mut pairing, Instant::now(), Utc::now());

        assert_eq!(registry.get_register_by_id(register_id).unwrap().actual_value, Value::Int(0x2A));
    }

    #[test]
    fn write_reply_clears_expected_pending() {
        let mut receiver = Receiver::new(5);
        let mut registry = Registry::new();
        let mut pairing = Pairing::new(PairingConfig::default());
        let device_id = registry.append_device(Uuid::new_v4(), 3, descriptor("dev"));
        let register_id = registry.upsert_register(Register::new_output(Uuid::new_v4(), device_id, 0, DataType::U8));
        registry.set_expected_value(register_id, Value::Int(9), Utc::now()).unwrap();

        let body = [RegisterKind::Output.byte(), 0, 9];
        let bytes = frame_bytes(PacketKind::WriteSingleRegister, &body);
        receiver.push_inbound(LinkFrame { sender_address: Some(3), bytes });
        receiver.loop_tick(&mut registry, &mut pairing, Instant::now(), Utc::now());

        assert!(!registry.get_register_by_id(register_id).unwrap().expected_pending);
    }

    #[test]
    fn malformed_frame_is_dropped_without_panic() {
        let mut receiver = Receiver::new(5);
        let mut registry = Registry::new();
        let mut pairing = Pairing::new(PairingConfig::default());
        receiver.push_inbound(LinkFrame { sender_address: Some(1), bytes: vec![0xFF, 0xFF] });
        receiver.loop_tick(&mut registry, &mut pairing, Instant::now(), Utc::now());
        assert!(receiver.is_empty());
    }
}
