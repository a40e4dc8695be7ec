//! Register record (spec §3).
//!
//! The four kinds share a base shape with kind-specific fields layered on;
//! rather than four near-identical structs this is one struct with the
//! fields that don't apply to a given `kind` left at their zero value
//! (`settable = false`, `expected_value = None`, ...), matching how the
//! teacher's `BlockerType` enum carries only the fields each variant needs
//! while the envelope (id, description) stays common.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::value::{DataType, Value};
use crate::wire::RegisterKind;

#[derive(Debug, Clone)]
pub struct Register {
    pub id: Uuid,
    pub device_id: Uuid,
    pub kind: RegisterKind,
    pub address: u8,
    pub data_type: DataType,
    pub key: Option<String>,

    /// Attribute-only: human-readable name.
    pub name: Option<String>,
    /// Attribute-only: whether the attribute accepts writes. Output and
    /// Setting registers are always settable.
    pub settable: bool,
    /// Attribute-only: whether the attribute can be read back.
    pub queryable: bool,

    pub actual_value: Value,
    pub actual_value_at: Option<DateTime<Utc>>,

    pub expected_value: Option<Value>,
    pub expected_value_at: Option<DateTime<Utc>>,
    pub expected_pending: bool,
}

impl Register {
    pub fn new_input(id: Uuid, device_id: Uuid, address: u8, data_type: DataType) -> Self {
        Self::bare(id, device_id, RegisterKind::Input, address, data_type)
    }

    pub fn new_output(id: Uuid, device_id: Uuid, address: u8, data_type: DataType) -> Self {
        let mut r = Self::bare(id, device_id, RegisterKind::Output, address, data_type);
        r.settable = true;
        r.queryable = true;
        r
    }

    pub fn new_attribute(
        id: Uuid,
        device_id: Uuid,
        address: u8,
        data_type: DataType,
        settable: bool,
        queryable: bool,
    ) -> Self {
        let mut r = Self::bare(id, device_id, RegisterKind::Attribute, address, data_type);
        r.settable = settable;
        r.queryable = queryable;
        r
    }

    pub fn new_setting(id: Uuid, device_id: Uuid, address: u8, data_type: DataType) -> Self {
        let mut r = Self::bare(id, device_id, RegisterKind::Setting, address, data_type);
        r.settable = true;
        r.queryable = true;
        r
    }

    fn bare(id: Uuid, device_id: Uuid, kind: RegisterKind, address: u8, data_type: DataType) -> Self {
        Self {
            id,
            device_id,
            kind,
            address,
            data_type,
            key: None,
            name: None,
            settable: false,
            queryable: false,
            actual_value: Value::None,
            actual_value_at: None,
            expected_value: None,
            expected_value_at: None,
            expected_pending: false,
        }
    }

    /// Eligible for publish once it has a known data type (spec §3).
    pub fn is_enumerated(&self) -> bool {
        self.data_type != DataType::Unknown
    }

    pub fn is_writable(&self) -> bool {
        self.settable
    }
}
