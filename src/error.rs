//! Crate-wide error types.
//!
//! Per-module errors (`FrameError` in `frame.rs`) stay local; this module
//! only aggregates the ones that cross a public API boundary, the same
//! split the teacher's core crates use (`SemOsError::Internal(#[from]
//! anyhow::Error)` wrapping lower-level failures rather than re-deriving
//! every variant at the top).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    DeviceNotFound(Uuid),

    #[error("register not found: {0}")]
    RegisterNotFound(Uuid),

    #[error("register is not writable")]
    RegisterNotWritable,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
