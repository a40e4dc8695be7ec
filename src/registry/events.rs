//! Registry change notifications (spec §4.3, design note §9
//! "Event bus → explicit observer list").
//!
//! Delivery is synchronous and in-thread. Observers must not mutate the
//! registry from inside `on_event` (spec §5) — they may only read.

use uuid::Uuid;

use crate::registry::device::ConnectionState;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DeviceCreatedOrUpdated { device_id: Uuid },
    DeviceStateChanged { device_id: Uuid, from: ConnectionState, to: ConnectionState },
    RegisterCreatedOrUpdated { register_id: Uuid, device_id: Uuid },
    ActualValueChanged { register_id: Uuid, value: Value },
    ExpectedValueChanged { register_id: Uuid, value: Option<Value> },
}

pub trait RegistryObserver: Send {
    fn on_event(&self, event: &RegistryEvent);
}

/// Test/CLI-friendly observer that just records everything it sees.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<RegistryEvent>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RegistryObserver for RecordingObserver {
    fn on_event(&self, event: &RegistryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
