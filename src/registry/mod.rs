//! In-memory device/register registry (spec §4.3).
//!
//! Keyed maps rather than a flat scan or a hash-set of records (spec §9,
//! "Set-of-dataclasses identified by id → keyed map"). Single-threaded by
//! design (spec §5) — no interior locking beyond what observers need for
//! their own bookkeeping.

pub mod device;
pub mod events;
pub mod register;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::value::Value;
use crate::wire::{MAX_ASSIGNABLE_ADDRESS, MIN_ASSIGNABLE_ADDRESS, RegisterKind};

pub use device::{ConnectionState, Device, DeviceDescriptor};
pub use events::{RegistryEvent, RegistryObserver};
pub use register::Register;

#[derive(Default)]
pub struct Registry {
    devices: HashMap<Uuid, Device>,
    by_address: HashMap<u8, Uuid>,
    by_serial: HashMap<String, Uuid>,

    registers: HashMap<Uuid, Register>,
    /// `(device_id, kind, address) -> register_id`
    by_device_kind_address: HashMap<(Uuid, RegisterKind, u8), Uuid>,
    by_key: HashMap<(Uuid, String), Uuid>,

    observers: Vec<Box<dyn RegistryObserver>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Box<dyn RegistryObserver>) {
        self.observers.push(observer);
    }

    fn notify(&self, event: RegistryEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    // ---- Device lookups -------------------------------------------------

    pub fn get_device_by_id(&self, id: Uuid) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_device_by_address(&self, address: u8) -> Option<&Device> {
        self.by_address.get(&address).and_then(|id| self.devices.get(id))
    }

    pub fn get_device_by_serial(&self, serial_number: &str) -> Option<&Device> {
        self.by_serial
            .get(serial_number)
            .and_then(|id| self.devices.get(id))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_ids(&self) -> Vec<Uuid> {
        self.devices.keys().copied().collect()
    }

    /// Insert a new device, or update the existing one sharing the same
    /// serial number in place (idempotent on serial number, spec §4.3).
    pub fn append_device(&mut self, id: Uuid, address: u8, descriptor: DeviceDescriptor) -> Uuid {
        if let Some(existing_id) = self.by_serial.get(&descriptor.serial_number).copied() {
            if let Some(device) = self.devices.get_mut(&existing_id) {
                if device.address != address {
                    self.by_address.remove(&device.address);
                }
                device.address = address;
                device.descriptor = descriptor;
                self.by_address.insert(address, existing_id);
                self.notify(RegistryEvent::DeviceCreatedOrUpdated {
                    device_id: existing_id,
                });
                return existing_id;
            }
        }

        self.by_serial.insert(descriptor.serial_number.clone(), id);
        self.by_address.insert(address, id);
        self.devices.insert(id, Device::new(id, address, descriptor));
        self.notify(RegistryEvent::DeviceCreatedOrUpdated { device_id: id });
        id
    }

    /// Drop a device and its registers entirely (host-initiated removal;
    /// spec §6, `remove_client`). Unlike `set_state`, this has no
    /// corresponding `RegistryEvent` — callers that need to react to
    /// removal should query `get_device_by_id` before calling this.
    pub fn remove_device(&mut self, device_id: Uuid) {
        let Some(device) = self.devices.remove(&device_id) else {
            return;
        };
        self.by_address.remove(&device.address);
        self.by_serial.remove(&device.descriptor.serial_number);

        let register_ids: Vec<Uuid> = self
            .registers
            .values()
            .filter(|r| r.device_id == device_id)
            .map(|r| r.id)
            .collect();
        for id in register_ids {
            if let Some(register) = self.registers.remove(&id) {
                self.by_device_kind_address
                    .remove(&(register.device_id, register.kind, register.address));
                if let Some(key) = &register.key {
                    self.by_key.remove(&(register.device_id, key.clone()));
                }
            }
        }
    }

    pub fn set_state(&mut self, device_id: Uuid, state: ConnectionState) -> Result<(), RegistryError> {
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or(RegistryError::DeviceNotFound(device_id))?;

        if device.state == state {
            return Ok(());
        }

        let from = device.state;
        device.state = state;
        self.notify(RegistryEvent::DeviceStateChanged {
            device_id,
            from,
            to: state,
        });
        Ok(())
    }

    /// Smallest address in `[1, 253]` not currently held by any device
    /// (spec §3, §4.3, §9 — tightened to "smallest free" for determinism).
    pub fn find_free_address(&self) -> Option<u8> {
        (MIN_ASSIGNABLE_ADDRESS..=MAX_ASSIGNABLE_ADDRESS).find(|addr| !self.by_address.contains_key(addr))
    }

    // ---- Register lookups -------------------------------------------------

    pub fn get_register_by_id(&self, id: Uuid) -> Option<&Register> {
        self.registers.get(&id)
    }

    pub fn get_register_by_address(
        &self,
        device_id: Uuid,
        kind: RegisterKind,
        address: u8,
    ) -> Option<&Register> {
        self.by_device_kind_address
            .get(&(device_id, kind, address))
            .and_then(|id| self.registers.get(id))
    }

    pub fn get_register_by_key(&self, device_id: Uuid, key: &str) -> Option<&Register> {
        self.by_key
            .get(&(device_id, key.to_string()))
            .and_then(|id| self.registers.get(id))
    }

    pub fn registers_for_device(&self, device_id: Uuid) -> impl Iterator<Item = &Register> {
        self.registers.values().filter(move |r| r.device_id == device_id)
    }

    /// Insert or update a register, keyed by `(device_id, kind, address)`.
    pub fn upsert_register(&mut self, register: Register) -> Uuid {
        let id = register.id;
        let index_key = (register.device_id, register.kind, register.address);

        if let Some(key) = &register.key {
            self.by_key.insert((register.device_id, key.clone()), id);
        }
        self.by_device_kind_address.insert(index_key, id);
        self.registers.insert(id, register);

        self.notify(RegistryEvent::RegisterCreatedOrUpdated {
            register_id: id,
            device_id: self.registers[&id].device_id,
        });
        id
    }

    /// Set the expected value + pending flag. No-op if the register is not
    /// writable or the value already matches the pending expectation
    /// (spec §4.3).
    pub fn set_expected_value(&mut self, register_id: Uuid, value: Value, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let register = self
            .registers
            .get_mut(&register_id)
            .ok_or(RegistryError::RegisterNotFound(register_id))?;

        if !register.settable {
            return Err(RegistryError::RegisterNotWritable);
        }

        if register.expected_value.as_ref() == Some(&value) {
            return Ok(());
        }

        register.expected_value = Some(value.clone());
        register.expected_value_at = Some(now);
        register.expected_pending = true;

        self.notify(RegistryEvent::ExpectedValueChanged {
            register_id,
            value: Some(value),
        });
        Ok(())
    }

    /// Record an observed actual value. Fires `ActualValueChanged` iff the
    /// value differs from the current actual value; clears a pending
    /// expected value atomically if it matches the new actual (spec §4.3,
    /// testable property 4).
    pub fn set_actual_value(
        &mut self,
        register_id: Uuid,
        value: Value,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let register = self
            .registers
            .get_mut(&register_id)
            .ok_or(RegistryError::RegisterNotFound(register_id))?;

        let changed = register.actual_value != value;
        if changed {
            register.actual_value = value.clone();
            register.actual_value_at = Some(at);
        }

        let mut cleared_expected = None;
        if register.expected_pending && register.expected_value.as_ref() == Some(&value) {
            register.expected_value = None;
            register.expected_value_at = None;
            register.expected_pending = false;
            cleared_expected = Some(());
        }

        if changed {
            self.notify(RegistryEvent::ActualValueChanged { register_id, value });
        }
        if cleared_expected.is_some() {
            self.notify(RegistryEvent::ExpectedValueChanged { register_id, value: None });
        }
        Ok(())
    }

    /// A device is ready for publish/finalization once none of its
    /// input/output registers are still `data_type = UNKNOWN` (spec §3).
    pub fn device_fully_enumerated(&self, device_id: Uuid) -> bool {
        self.registers_for_device(device_id)
            .filter(|r| matches!(r.kind, RegisterKind::Input | RegisterKind::Output))
            .all(|r| r.is_enumerated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register::Register;
    use crate::value::DataType;

    fn descriptor(serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            serial_number: serial.to_string(),
            hardware_version: "1.0".into(),
            hardware_model: "model".into(),
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

    #[test]
    fn free_address_is_smallest_available() {
        let mut reg = Registry::new();
        reg.append_device(Uuid::new_v4(), 1, descriptor("a"));
        reg.append_device(Uuid::new_v4(), 2, descriptor("b"));
        assert_eq!(reg.find_free_address(), Some(3));
    }

    #[test]
    fn free_address_saturated_returns_none() {
        let mut reg = Registry::new();
        for addr in MIN_ASSIGNABLE_ADDRESS..=MAX_ASSIGNABLE_ADDRESS {
            reg.append_device(Uuid::new_v4(), addr, descriptor(&addr.to_string()));
        }
        assert_eq!(reg.find_free_address(), None);
    }

    #[test]
    fn append_device_is_idempotent_on_serial() {
        let mut reg = Registry::new();
        let id = Uuid::new_v4();
        let first = reg.append_device(id, 1, descriptor("same"));
        let second = reg.append_device(Uuid::new_v4(), 2, descriptor("same"));
        assert_eq!(first, second);
        assert_eq!(reg.get_device_by_id(first).unwrap().address, 2);
        assert_eq!(reg.devices().count(), 1);

        // Re-pairing to a new address must free the old one, not just claim the new one.
        assert!(reg.get_device_by_address(1).is_none());
        assert_eq!(reg.get_device_by_address(2).map(|d| d.id), Some(first));
        assert_eq!(reg.find_free_address(), Some(1));
    }

    #[test]
    fn set_state_noop_when_unchanged() {
        use std::sync::{Arc, Mutex};

        struct Counter(Arc<Mutex<u32>>);
        impl RegistryObserver for Counter {
            fn on_event(&self, _event: &RegistryEvent) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let count = Arc::new(Mutex::new(0));
        let mut reg = Registry::new();
        reg.add_observer(Box::new(Counter(count.clone())));
        let id = reg.append_device(Uuid::new_v4(), 1, descriptor("x"));

        let before = *count.lock().unwrap();
        reg.set_state(id, ConnectionState::Ready).unwrap();
        reg.set_state(id, ConnectionState::Ready).unwrap();

        // One event for the actual transition; the repeated `Ready` call
        // must not fire again.
        assert_eq!(*count.lock().unwrap(), before + 1);
    }

    #[test]
    fn expected_then_actual_clears_pending_and_fires_once() {
        let mut reg = Registry::new();
        let device_id = reg.append_device(Uuid::new_v4(), 1, descriptor("dev"));
        let register_id = reg.upsert_register(Register::new_output(
            Uuid::new_v4(),
            device_id,
            1,
            DataType::U8,
        ));

        let now = Utc::now();
        reg.set_expected_value(register_id, Value::Int(42), now).unwrap();
        assert!(reg.get_register_by_id(register_id).unwrap().expected_pending);

        reg.set_actual_value(register_id, Value::Int(42), now).unwrap();
        let register = reg.get_register_by_id(register_id).unwrap();
        assert!(!register.expected_pending);
        assert_eq!(register.expected_value, None);
        assert_eq!(register.actual_value, Value::Int(42));
    }

    #[test]
    fn remove_device_drops_device_and_its_registers() {
        let mut reg = Registry::new();
        let device_id = reg.append_device(Uuid::new_v4(), 5, descriptor("dev"));
        let register_id = reg.upsert_register(Register::new_input(Uuid::new_v4(), device_id, 0, DataType::U8));

        reg.remove_device(device_id);

        assert!(reg.get_device_by_id(device_id).is_none());
        assert!(reg.get_device_by_address(5).is_none());
        assert!(reg.get_device_by_serial("dev").is_none());
        assert!(reg.get_register_by_id(register_id).is_none());
    }

    #[test]
    fn set_expected_value_rejects_read_only_register() {
        let mut reg = Registry::new();
        let device_id = reg.append_device(Uuid::new_v4(), 1, descriptor("dev"));
        let register_id = reg.upsert_register(Register::new_input(
            Uuid::new_v4(),
            device_id,
            1,
            DataType::U8,
        ));

        let result = reg.set_expected_value(register_id, Value::Int(1), Utc::now());
        assert!(matches!(result, Err(RegistryError::RegisterNotWritable)));
    }
}
