//! Outbound request scheduling (spec §4.5).
//!
//! One device advances per tick, chosen by a round-robin pointer over
//! devices in READY/INIT state. Back-pressure (BUSY/FAIL) retries the same
//! device up to three times before it is declared LOST — a second, smaller
//! counter than the Receiver's reply-watchdog, since this one fires on send
//! failure rather than on a missing reply.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::frame;
use crate::link::{Link, SendResult};
use crate::receiver::{AwaitedKind, Receiver};
use crate::registry::{ConnectionState, Registry};
use crate::value::Value;
use crate::wire::{PacketKind, ProtocolVersion, RegisterKind};

/// How long the Receiver will wait for a reply before counting a miss
/// against a request this module issued. Not pinned by the spec beyond
/// "the reply-watchdog" existing (§4.4); chosen to comfortably exceed one
/// host tick interval (spec §5, "host must call loop() at least every
/// ~200ms").
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Back-pressure retries before a device is declared LOST (spec §4.5).
pub const MAX_SEND_RETRIES: u32 = 3;

enum Effect {
    MarkKindFullyRead { device_id: Uuid, kind: RegisterKind },
    MarkAllRead { device_id: Uuid },
    None,
}

struct PendingRequest {
    frame: Vec<u8>,
    awaited: AwaitedKind,
    effect: Effect,
}

#[derive(Default)]
pub struct Publisher {
    retry_counts: HashMap<Uuid, u32>,
    /// Kinds already read at least once, per device (spec §4.5 step 2,
    /// "device has never been fully read").
    read_kinds: HashMap<Uuid, Vec<RegisterKind>>,
    last_read_at: HashMap<Uuid, Instant>,
    last_served: Option<Uuid>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forget_device(&mut self, device_id: Uuid) {
        self.retry_counts.remove(&device_id);
        self.read_kinds.remove(&device_id);
        self.last_read_at.remove(&device_id);
    }

    /// One tick: advance exactly one device (spec §4.5, "at most one
    /// outbound request per device per tick").
    pub fn loop_tick(
        &mut self,
        registry: &mut Registry,
        receiver: &mut Receiver,
        link: &mut dyn Link,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) {
        let mut candidates: Vec<Uuid> = registry
            .devices()
            .filter(|d| matches!(d.state, ConnectionState::Ready | ConnectionState::Init))
            .map(|d| d.id)
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by_key(|id| registry.get_device_by_id(*id).map(|d| d.address).unwrap_or(0));

        let start = match self.last_served {
            Some(id) => candidates
                .iter()
                .position(|c| *c == id)
                .map(|i| (i + 1) % candidates.len())
                .unwrap_or(0),
            None => 0,
        };
        let device_id = candidates[start];

        let Some(device) = registry.get_device_by_id(device_id) else {
            return;
        };
        let address = device.address;
        let sampling_period = device.sampling_period;

        let Some(request) = self.build_request(registry, device_id, sampling_period, now) else {
            // Nothing to do for this device this tick; rotate past it so
            // sibling devices are not starved.
            self.last_served = Some(device_id);
            return;
        };

        match link.send(address, &request.frame) {
            SendResult::Accepted => {
                self.retry_counts.remove(&device_id);
                receiver.record_request(device_id, request.awaited, now + REPLY_TIMEOUT);
                self.apply_effect(request.effect, now);
                self.last_served = Some(device_id);
            }
            SendResult::Busy | SendResult::Fail => {
                let count = self.retry_counts.entry(device_id).or_insert(0);
                *count += 1;
                if *count >= MAX_SEND_RETRIES {
                    warn!(%device_id, "publisher exhausted send retries, marking device LOST");
                    if let Err(err) = registry.set_state(device_id, ConnectionState::Lost) {
                        warn!(%device_id, %err, "failed to mark device LOST after send failure");
                    }
                    self.retry_counts.remove(&device_id);
                    self.last_served = Some(device_id);
                }
                // else: leave `last_served` untouched so the same device is retried next tick.
            }
        }

        let _ = now_utc;
    }

    fn apply_effect(&mut self, effect: Effect, now: Instant) {
        match effect {
            Effect::MarkKindFullyRead { device_id, kind } => {
                self.read_kinds.entry(device_id).or_default().push(kind);
                self.last_read_at.insert(device_id, now);
            }
            Effect::MarkAllRead { device_id } => {
                self.last_read_at.insert(device_id, now);
            }
            Effect::None => {}
        }
    }

    fn build_request(
        &self,
        registry: &Registry,
        device_id: Uuid,
        sampling_period: Duration,
        now: Instant,
    ) -> Option<PendingRequest> {
        if let Some(write) = self.build_write_request(registry, device_id) {
            return Some(write);
        }
        if let Some(kind) = self.next_unread_kind(registry, device_id) {
            return Some(self.build_read_multiple(registry, device_id, kind));
        }
        let due = self
            .last_read_at
            .get(&device_id)
            .map_or(true, |last| now.saturating_duration_since(*last) >= sampling_period);
        if due {
            return self.build_periodic_reread(registry, device_id);
        }
        None
    }

    /// Oldest pending write first (spec §4.5 step 1).
    fn build_write_request(&self, registry: &Registry, device_id: Uuid) -> Option<PendingRequest> {
        let register = registry
            .registers_for_device(device_id)
            .filter(|r| r.expected_pending)
            .min_by_key(|r| r.expected_value_at)?;

        let value = register.expected_value.as_ref()?;
        let encoded = value.encode(register.data_type)?;

        let mut body = vec![register.kind.byte(), register.address];
        body.extend_from_slice(&encoded);
        let frame = build_frame(PacketKind::WriteSingleRegister, &body);

        Some(PendingRequest {
            frame,
            awaited: AwaitedKind::WriteReply,
            effect: Effect::None,
        })
    }

    /// The next register kind this device has never been read for at least
    /// once (spec §4.5 step 2). Only kinds the device actually has
    /// registers for are considered.
    fn next_unread_kind(&self, registry: &Registry, device_id: Uuid) -> Option<RegisterKind> {
        let already_read = self.read_kinds.get(&device_id);
        RegisterKind::ENUMERATION_ORDER.into_iter().find(|kind| {
            let has_registers = registry
                .registers_for_device(device_id)
                .any(|r| r.kind == *kind);
            has_registers && !already_read.is_some_and(|read| read.contains(kind))
        })
    }

    fn build_read_multiple(&self, registry: &Registry, device_id: Uuid, kind: RegisterKind) -> PendingRequest {
        let count = registry.registers_for_device(device_id).filter(|r| r.kind == kind).count() as u8;
        let body = vec![kind.byte(), 0, count];
        let frame = build_frame(PacketKind::ReadMultipleRegisters, &body);

        PendingRequest {
            frame,
            awaited: AwaitedKind::ReadReply,
            effect: Effect::MarkKindFullyRead { device_id, kind },
        }
    }

    /// Periodic re-read once `sampling_period` has elapsed (spec §4.5 step
    /// 3): input/output kinds only, the ones consumers actually poll.
    fn build_periodic_reread(&self, registry: &Registry, device_id: Uuid) -> Option<PendingRequest> {
        let kind = [RegisterKind::Input, RegisterKind::Output]
            .into_iter()
            .find(|k| registry.registers_for_device(device_id).any(|r| r.kind == *k))?;
        let count = registry.registers_for_device(device_id).filter(|r| r.kind == kind).count() as u8;
        let body = vec![kind.byte(), 0, count];
        let frame = build_frame(PacketKind::ReadMultipleRegisters, &body);

        Some(PendingRequest {
            frame,
            awaited: AwaitedKind::ReadReply,
            effect: Effect::MarkAllRead { device_id },
        })
    }
}

fn build_frame(kind: PacketKind, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![ProtocolVersion::V1.byte(), kind.byte()];
    payload.extend_from_slice(body);
    frame::encode(&payload)
}
