//! Pairing state machine (spec §4.6).
//!
//! Two phases: broadcast SEARCH until attempts are exhausted, then enroll
//! found devices one at a time through WRITE_ADDRESS, PROVIDE_REGISTER_STRUCTURE
//! (repeated once per still-`UNKNOWN` register) and PAIRING_FINISHED.
//!
//! `found_devices` replaces the source's hash-set-of-dataclasses with a
//! plain `Vec` in arrival order (spec §9, "Set-of-dataclasses identified by
//! id → keyed map") — a `Vec` rather than a map here because discovery order
//! is itself the invariant callers rely on (spec §8 S3: devices are assigned
//! addresses "in reply order").

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame;
use crate::link::Link;
use crate::registry::{ConnectionState, DeviceDescriptor, Registry};
use crate::value::DataType;
use crate::wire::{DiscoverCommand, PacketKind, ProtocolVersion, RegisterKind, BROADCAST_ADDR};

#[derive(Debug, Clone, Copy)]
pub struct PairingConfig {
    pub searching_delay: Duration,
    pub max_searching_attempts: u32,
    pub broadcast_waiting_delay: Duration,
    pub max_transmit_attempts: u32,
    pub max_pairing_delay: Duration,
    pub max_total_transmit_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            searching_delay: Duration::from_secs(2),
            max_searching_attempts: 5,
            broadcast_waiting_delay: Duration::from_secs(2),
            max_transmit_attempts: 5,
            max_pairing_delay: Duration::from_secs(5),
            max_total_transmit_attempts: 100,
        }
    }
}

struct FoundDevice {
    serial_number: String,
    descriptor: DeviceDescriptor,
}

#[derive(Debug, Clone)]
struct PendingRegister {
    kind: RegisterKind,
    address: u8,
    data_type: DataType,
    key: Option<String>,
    settable: bool,
    queryable: bool,
}

struct PairingDevice {
    id: Uuid,
    serial_number: String,
    address: u8,
    descriptor: DeviceDescriptor,
    pending_registers: Vec<PendingRegister>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdPhase {
    Pending,
    AwaitingReply { sent_at: Instant, attempts: u32 },
    Acked,
}

struct EnrollingState {
    device: PairingDevice,
    write_address_done: bool,
    pairing_finished_done: bool,
    phase: CmdPhase,
}

impl EnrollingState {
    /// Which command is outstanding right now, following the fixed
    /// WRITE_ADDRESS -> PROVIDE_REGISTER_STRUCTURE* -> PAIRING_FINISHED
    /// sequence (spec §4.6 phase 2).
    fn current_cmd(&self) -> Option<DiscoverCommand> {
        if !self.write_address_done {
            Some(DiscoverCommand::WriteAddress)
        } else if self.next_unknown_register().is_some() {
            Some(DiscoverCommand::ProvideRegisterStructure)
        } else if !self.pairing_finished_done {
            Some(DiscoverCommand::PairingFinished)
        } else {
            None
        }
    }

    fn next_unknown_register(&self) -> Option<usize> {
        self.device
            .pending_registers
            .iter()
            .position(|r| r.data_type == DataType::Unknown)
    }
}

enum PairingState {
    Disabled,
    Searching { attempts: u32, last_broadcast: Option<Instant> },
    Enrolling(EnrollingState),
}

pub struct Pairing {
    config: PairingConfig,
    enabled: bool,
    state: PairingState,
    found_devices: Vec<FoundDevice>,
    total_attempts: u32,
}

impl Pairing {
    pub fn new(config: PairingConfig) -> Self {
        Self {
            config,
            enabled: false,
            state: PairingState::Disabled,
            found_devices: Vec::new(),
            total_attempts: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        info!("pairing enabled, entering SEARCHING");
        self.enabled = true;
        self.state = PairingState::Searching { attempts: 0, last_broadcast: None };
        self.found_devices.clear();
        self.total_attempts = 0;
    }

    pub fn disable(&mut self) {
        info!("pairing disabled");
        self.enabled = false;
        self.state = PairingState::Disabled;
    }

    /// Called by the Receiver when a DISCOVER reply arrives (spec §4.4,
    /// §4.6 "transitions are driven by incoming replies").
    pub fn on_reply(&mut self, cmd: DiscoverCommand, sender_address: Option<u8>, body: &[u8], _now: Instant) {
        if cmd == DiscoverCommand::Search {
            self.on_search_reply(body);
            return;
        }

        let PairingState::Enrolling(enrolling) = &mut self.state else {
            debug!(?cmd, "discarding DISCOVER reply received outside enrollment");
            return;
        };

        if Some(cmd) != enrolling.current_cmd() {
            debug!(?cmd, "discarding DISCOVER reply for a command we are not awaiting");
            return;
        }
        if !matches!(enrolling.phase, CmdPhase::AwaitingReply { .. }) {
            return;
        }

        match cmd {
            DiscoverCommand::WriteAddress => {
                enrolling.write_address_done = true;
            }
            DiscoverCommand::ProvideRegisterStructure => {
                if let Some(update) = decode_register_structure_reply(body) {
                    if let Some(reg) = enrolling
                        .device
                        .pending_registers
                        .iter_mut()
                        .find(|r| r.kind == update.0 && r.address == update.1)
                    {
                        reg.data_type = update.2;
                        reg.key = update.3;
                        reg.settable = update.4;
                        reg.queryable = update.5;
                    }
                } else {
                    warn!("malformed PROVIDE_REGISTER_STRUCTURE reply body, register stays UNKNOWN");
                }
            }
            DiscoverCommand::PairingFinished => {
                enrolling.pairing_finished_done = true;
            }
            DiscoverCommand::Search => unreachable!("handled above"),
        }

        let _ = sender_address;
        enrolling.phase = CmdPhase::Acked;
    }

    fn on_search_reply(&mut self, body: &[u8]) {
        if !matches!(self.state, PairingState::Searching { .. }) {
            return;
        }
        let Some(descriptor) = DeviceDescriptor::decode(body) else {
            warn!("malformed SEARCH reply body, dropping");
            return;
        };
        if self.found_devices.iter().any(|f| f.serial_number == descriptor.serial_number) {
            return;
        }
        debug!(serial = %descriptor.serial_number, "device replied to SEARCH");
        self.found_devices.push(FoundDevice {
            serial_number: descriptor.serial_number.clone(),
            descriptor,
        });
    }

    /// One tick of pairing activity (spec §4.6). Only ever called while
    /// `is_enabled()`.
    pub fn loop_tick(&mut self, registry: &mut Registry, link: &mut dyn Link, now: Instant) {
        if !self.enabled {
            return;
        }
        if self.total_attempts >= self.config.max_total_transmit_attempts {
            warn!("pairing total transmit attempt cap reached, disabling");
            self.disable();
            return;
        }

        match &mut self.state {
            PairingState::Disabled => {}
            PairingState::Searching { attempts, last_broadcast } => {
                let attempts = *attempts;
                let due = last_broadcast.map_or(true, |t| now.saturating_duration_since(t) >= self.config.searching_delay);

                if attempts >= self.config.max_searching_attempts {
                    self.discover_device(registry, now);
                } else if due {
                    self.broadcast_search(link, now);
                }
            }
            PairingState::Enrolling(_) => self.tick_enrolling(registry, link, now),
        }
    }

    fn broadcast_search(&mut self, link: &mut dyn Link, now: Instant) {
        let PairingState::Searching { attempts, last_broadcast } = &mut self.state else {
            return;
        };
        *attempts += 1;
        *last_broadcast = Some(now);
        self.total_attempts += 1;

        let payload = [ProtocolVersion::V1.byte(), PacketKind::Discover.byte(), DiscoverCommand::Search.byte()];
        let frame = frame::encode(&payload);
        crate::link::ack_wait(link, BROADCAST_ADDR, &frame, self.config.broadcast_waiting_delay, Instant::now);
    }

    fn tick_enrolling(&mut self, registry: &mut Registry, link: &mut dyn Link, now: Instant) {
        let PairingState::Enrolling(enrolling) = &mut self.state else {
            return;
        };

        let Some(cmd) = enrolling.current_cmd() else {
            self.finish_current_device(registry, now);
            return;
        };

        match enrolling.phase {
            CmdPhase::Acked => {
                enrolling.phase = CmdPhase::Pending;
                // Re-evaluate `current_cmd` next tick now that the previous
                // step's completion flag has flipped.
            }
            CmdPhase::Pending => {
                self.send_enrolling_cmd(link, cmd, now);
            }
            CmdPhase::AwaitingReply { sent_at, attempts } => {
                let elapsed = now.saturating_duration_since(sent_at);
                if elapsed < self.config.max_pairing_delay {
                    return;
                }
                if attempts >= self.config.max_transmit_attempts {
                    warn!(serial = %enrolling.device.serial_number, ?cmd, "pairing command exhausted retries, dropping device");
                    self.discover_device(registry, now);
                } else {
                    self.send_enrolling_cmd(link, cmd, now);
                }
            }
        }
    }

    fn send_enrolling_cmd(&mut self, link: &mut dyn Link, cmd: DiscoverCommand, now: Instant) {
        let PairingState::Enrolling(enrolling) = &mut self.state else {
            return;
        };

        let mut body = vec![PacketKind::Discover.byte(), cmd.byte()];
        match cmd {
            DiscoverCommand::WriteAddress => {
                body.push(enrolling.device.address);
                let serial = enrolling.device.serial_number.as_bytes();
                body.push(serial.len().min(255) as u8);
                body.extend_from_slice(serial);
            }
            DiscoverCommand::ProvideRegisterStructure => {
                let Some(idx) = enrolling.next_unknown_register() else {
                    return;
                };
                let reg = &enrolling.device.pending_registers[idx];
                body.push(reg.kind.byte());
                body.push(reg.address);
            }
            DiscoverCommand::PairingFinished => {}
            DiscoverCommand::Search => unreachable!(),
        }

        let mut payload = vec![ProtocolVersion::V1.byte()];
        payload.extend_from_slice(&body);
        let frame = frame::encode(&payload);

        let address = enrolling.device.address;
        let _ = link.send(address, &frame);

        let attempts = match enrolling.phase {
            CmdPhase::AwaitingReply { attempts, .. } => attempts + 1,
            _ => 1,
        };
        enrolling.phase = CmdPhase::AwaitingReply { sent_at: now, attempts };
        self.total_attempts += 1;
    }

    /// Pop the next found device and prepare it for enrollment, or disable
    /// pairing once the queue is drained (spec §4.6).
    fn discover_device(&mut self, registry: &mut Registry, now: Instant) {
        let _ = now;
        loop {
            let Some(found) = (!self.found_devices.is_empty()).then(|| self.found_devices.remove(0)) else {
                info!("no more discovered devices, disabling pairing");
                self.disable();
                return;
            };

            let existing = registry.get_device_by_serial(&found.serial_number).cloned();
            let address = match &existing {
                Some(dev) if dev.is_assigned() => dev.address,
                _ => match registry.find_free_address() {
                    Some(addr) => addr,
                    None => {
                        warn!(serial = %found.serial_number, "no free bus address, skipping device");
                        continue;
                    }
                },
            };

            let id = existing.as_ref().map_or_else(Uuid::new_v4, |d| d.id);
            if let Some(dev) = &existing {
                let _ = registry.set_state(dev.id, ConnectionState::Pairing);
            }

            let pending_registers = build_pending_registers(id, &found.descriptor, registry);
            let write_address_done = existing.as_ref().is_some_and(|d| d.is_assigned() && d.address == address);

            info!(serial = %found.serial_number, address, "starting enrollment");
            self.state = PairingState::Enrolling(EnrollingState {
                device: PairingDevice {
                    id,
                    serial_number: found.serial_number,
                    address,
                    descriptor: found.descriptor,
                    pending_registers,
                },
                write_address_done,
                pairing_finished_done: false,
                phase: CmdPhase::Pending,
            });
            return;
        }
    }

    fn finish_current_device(&mut self, registry: &mut Registry, now: Instant) {
        let PairingState::Enrolling(enrolling) = &self.state else {
            return;
        };

        let device_id = registry.append_device(enrolling.device.id, enrolling.device.address, enrolling.device.descriptor.clone());
        for reg in &enrolling.device.pending_registers {
            let register = crate::registry::Register {
                id: Uuid::new_v4(),
                device_id,
                kind: reg.kind,
                address: reg.address,
                data_type: reg.data_type,
                key: reg.key.clone(),
                name: None,
                settable: reg.settable || matches!(reg.kind, RegisterKind::Output | RegisterKind::Setting),
                queryable: reg.queryable || matches!(reg.kind, RegisterKind::Output | RegisterKind::Setting),
                actual_value: crate::value::Value::None,
                actual_value_at: None,
                expected_value: None,
                expected_value_at: None,
                expected_pending: false,
            };
            registry.upsert_register(register);
        }
        if let Err(err) = registry.set_state(device_id, ConnectionState::Ready) {
            warn!(%device_id, %err, "failed to move enrolled device to READY");
        }
        info!(%device_id, "enrollment finished, device READY");

        self.discover_device(registry, now);
    }
}

fn build_pending_registers(device_id: Uuid, descriptor: &DeviceDescriptor, registry: &Registry) -> Vec<PendingRegister> {
    let sizes = [
        (RegisterKind::Input, descriptor.input_registers_size),
        (RegisterKind::Output, descriptor.output_registers_size),
        (RegisterKind::Attribute, descriptor.attributes_registers_size),
        (RegisterKind::Setting, descriptor.settings_registers_size),
    ];

    let mut pending = Vec::new();
    for (kind, size) in sizes {
        for address in 0..size {
            if let Some(existing) = registry.get_register_by_address(device_id, kind, address) {
                pending.push(PendingRegister {
                    kind,
                    address,
                    data_type: DataType::Unknown,
                    key: existing.key.clone(),
                    settable: existing.settable,
                    queryable: existing.queryable,
                });
            } else {
                pending.push(PendingRegister {
                    kind,
                    address,
                    data_type: DataType::Unknown,
                    key: None,
                    settable: false,
                    queryable: false,
                });
            }
        }
    }
    pending
}

/// `(kind, address, data_type, key, settable, queryable)` from a
/// PROVIDE_REGISTER_STRUCTURE reply body:
/// `[kind, address, data_type, key_len, key_bytes.., settable, queryable]`.
fn decode_register_structure_reply(body: &[u8]) -> Option<(RegisterKind, u8, DataType, Option<String>, bool, bool)> {
    let &[kind_byte, address, data_type_byte, key_len, ref rest @ ..] = body else {
        return None;
    };
    let kind = RegisterKind::try_from(kind_byte).ok()?;
    let data_type = decode_data_type_byte(data_type_byte)?;
    let key_len = key_len as usize;
    let key_bytes = rest.get(..key_len)?;
    let key = if key_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8(key_bytes.to_vec()).ok()?)
    };
    let tail = rest.get(key_len..key_len + 2)?;
    Some((kind, address, data_type, key, tail[0] != 0, tail[1] != 0))
}

fn decode_data_type_byte(byte: u8) -> Option<DataType> {
    Some(match byte {
        0 => DataType::Unknown,
        1 => DataType::Bool,
        2 => DataType::U8,
        3 => DataType::U16,
        4 => DataType::U32,
        5 => DataType::I8,
        6 => DataType::I16,
        7 => DataType::I32,
        8 => DataType::Float,
        9 => DataType::String,
        10 => DataType::Enum,
        11 => DataType::Button,
        12 => DataType::Switch,
        13 => DataType::Datetime,
        _ => return None,
    })
}
