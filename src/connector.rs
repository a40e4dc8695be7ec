//! Top-level orchestrator (spec §4.7).
//!
//! Owns every other component and drives them in the fixed per-tick order
//! the spec requires: Receiver, Consumer, then Pairing-or-Publisher, then
//! a final `Link.poll()`. This is the only public surface the host embeds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::link::Link;
use crate::pairing::{Pairing, PairingConfig};
use crate::publisher::Publisher;
use crate::receiver::Receiver;
use crate::registry::{ConnectionState, Registry, RegistryEvent, RegistryObserver};
use crate::value::{DataType, Value};

struct ConsumerSink {
    queue: Arc<Mutex<VecDeque<RegistryEvent>>>,
}

impl RegistryObserver for ConsumerSink {
    fn on_event(&self, event: &RegistryEvent) {
        self.queue.lock().unwrap().push_back(event.clone());
    }
}

/// Drains registry change events and forwards them to whatever the host
/// registered (spec §4.7, "Consumer.loop() drains any queued inbound work
/// items"). Not a component letter of its own in the spec's component
/// table, but named explicitly in the orchestration sequence.
#[derive(Default)]
pub struct Consumer {
    queue: Arc<Mutex<VecDeque<RegistryEvent>>>,
    sinks: Vec<Box<dyn Fn(&RegistryEvent) + Send>>,
}

impl Consumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn observer(&self) -> Box<dyn RegistryObserver> {
        Box::new(ConsumerSink { queue: self.queue.clone() })
    }

    pub fn add_sink(&mut self, sink: Box<dyn Fn(&RegistryEvent) + Send>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    fn loop_tick(&mut self) {
        loop {
            let event = self.queue.lock().unwrap().pop_front();
            let Some(event) = event else { break };
            for sink in &self.sinks {
                sink(&event);
            }
        }
    }
}

pub struct Connector {
    config: GatewayConfig,
    registry: Registry,
    receiver: Receiver,
    publisher: Publisher,
    pairing: Pairing,
    consumer: Consumer,
    link: Box<dyn Link>,
    stopped: bool,
    /// Whether the single configured bus client is allowed to send. The
    /// Python original supports several named clients behind one connector;
    /// this crate is scoped to exactly one bus (spec §6), so that becomes a
    /// flag rather than a keyed collection.
    client_enabled: bool,
}

impl Connector {
    pub fn new(config: GatewayConfig, link: Box<dyn Link>) -> Self {
        let mut registry = Registry::new();
        let consumer = Consumer::new();
        registry.add_observer(consumer.observer());

        Self {
            config,
            registry,
            receiver: Receiver::default(),
            publisher: Publisher::new(),
            pairing: Pairing::new(PairingConfig::default()),
            consumer,
            link,
            stopped: true,
            client_enabled: false,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn add_consumer_sink(&mut self, sink: Box<dyn Fn(&RegistryEvent) + Send>) {
        self.consumer.add_sink(sink);
    }

    /// Replace the bus client configuration (spec §6, `configure_client`).
    pub fn configure_client(&mut self, config: GatewayConfig) {
        self.config = config;
    }

    pub fn enable_client(&mut self) -> bool {
        tracing::info!("bus client enabled");
        self.client_enabled = true;
        true
    }

    pub fn disable_client(&mut self) -> bool {
        tracing::info!("bus client disabled");
        self.client_enabled = false;
        true
    }

    /// Tear down the configured client: disable it and drop back to
    /// defaults, mirroring the Python original's `client.remove_client`
    /// (there it drops the client from a keyed collection; here, with a
    /// single client, that is equivalent to resetting it).
    pub fn remove_client(&mut self) -> bool {
        self.client_enabled = false;
        self.config = GatewayConfig::default();
        true
    }

    pub fn enable_pairing(&mut self) {
        self.pairing.enable();
    }

    pub fn disable_pairing(&mut self) {
        self.pairing.disable();
    }

    /// Reset every known device to UNKNOWN and resume normal ticking (spec
    /// §4.7).
    pub fn start(&mut self) {
        for id in self.registry.device_ids() {
            let _ = self.registry.set_state(id, ConnectionState::Unknown);
        }
        self.stopped = false;
        tracing::info!("connector started");
    }

    /// Reset every known device to UNKNOWN and stop issuing new outbound
    /// work; inbound draining continues until `has_unfinished_tasks()` is
    /// false (spec §4.7, §5).
    pub fn stop(&mut self) {
        for id in self.registry.device_ids() {
            let _ = self.registry.set_state(id, ConnectionState::Unknown);
        }
        self.stopped = true;
        tracing::info!("connector stopped");
    }

    pub fn write_register_value(&mut self, register_id: Uuid, value: Value) -> bool {
        if self.stopped {
            tracing::warn!("connector is stopped, value can't be written");
            return false;
        }
        self.registry.set_expected_value(register_id, value, Utc::now()).is_ok()
    }

    /// Set the expected value on every register across all devices sharing
    /// `key` (spec §6, `broadcast_value`). `data_type` is accepted for
    /// symmetry with the runtime API but is not consulted — each register
    /// already carries its own enumerated data type, and `set_expected_value`
    /// leaves type-mismatched writes for `Publisher::build_write_request`'s
    /// `Value::encode` to reject at send time.
    pub fn broadcast_value(&mut self, key: &str, value: Value, data_type: DataType) -> bool {
        let _ = data_type;
        let now = Utc::now();
        let register_ids: Vec<Uuid> = self
            .registry
            .devices()
            .flat_map(|d| self.registry.registers_for_device(d.id))
            .filter(|r| r.key.as_deref() == Some(key))
            .map(|r| r.id)
            .collect();

        if register_ids.is_empty() {
            return false;
        }
        register_ids
            .into_iter()
            .all(|register_id| self.registry.set_expected_value(register_id, value.clone(), now).is_ok())
    }

    /// Receiver or Consumer queues non-empty (spec §4.7).
    pub fn has_unfinished_tasks(&self) -> bool {
        !self.receiver.is_empty() || !self.consumer.is_empty()
    }

    /// One orchestration tick, in the exact order spec §4.7 specifies.
    pub fn tick(&mut self, now: Instant, now_utc: DateTime<Utc>) {
        for frame in self.link.take_received() {
            self.receiver.push_inbound(frame);
        }
        self.receiver.loop_tick(&mut self.registry, &mut self.pairing, now, now_utc);

        self.consumer.loop_tick();

        if self.stopped && !self.has_unfinished_tasks() {
            return;
        }

        if self.client_enabled {
            if self.pairing.is_enabled() {
                self.pairing.loop_tick(&mut self.registry, self.link.as_mut(), now);
            } else {
                self.publisher
                    .loop_tick(&mut self.registry, &mut self.receiver, self.link.as_mut(), now, now_utc);
            }
        }

        let _ = self.link.poll();
    }

    /// Drive `tick()` forever at a fixed cadence. Never returns; spawn it as
    /// a background task (spec §4.7 — the core stays synchronous, only this
    /// outer loop is async), the same shape as the teacher's
    /// `OutboxDispatcher::run`.
    pub async fn run_forever(&mut self, interval: Duration) {
        loop {
            self.tick(Instant::now(), Utc::now());
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;
    use crate::registry::register::Register;
    use crate::registry::DeviceDescriptor;

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
            output_registers_size: 1,
            attributes_registers_size: 0,
            settings_registers_size: 0,
        }
    }

    #[test]
    fn stop_then_drain_then_noop() {
        let mut connector = Connector::new(GatewayConfig::default(), Box::new(MockLink::new()));
        connector.start();
        connector.stop();

        let now = Instant::now();
        let now_utc = Utc::now();
        connector.tick(now, now_utc);
        assert!(!connector.has_unfinished_tasks());

        // Further ticks are no-ops: nothing new gets sent while stopped and
        // queues are empty.
        connector.tick(now, now_utc);
    }

    #[test]
    fn write_register_value_is_sent_on_next_tick() {
        let mut link = MockLink::new();
        link.queue_send_status(crate::link::SendStatus::Ack);
        let mut connector = Connector::new(GatewayConfig::default(), Box::new(link));
        connector.start();
        connector.enable_client();

        let id = connector.registry.append_device(Uuid::new_v4(), 1, descriptor("dev"));
        let register_id = connector
            .registry
            .upsert_register(Register::new_output(Uuid::new_v4(), id, 0, DataType::U8));
        connector.registry.set_state(id, ConnectionState::Ready).unwrap();

        assert!(connector.write_register_value(register_id, Value::Int(5)));
        assert!(connector.registry().get_register_by_id(register_id).unwrap().expected_pending);

        connector.tick(Instant::now(), Utc::now());

        // The write was handed to the link; the registry still shows it
        // pending until a REPORT/ack frame clears it via the Receiver.
        assert!(connector.registry().get_register_by_id(register_id).unwrap().expected_pending);
    }
}
