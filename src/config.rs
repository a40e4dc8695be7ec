//! Gateway configuration (spec §6).
//!
//! Loaded from environment variables the way `sem_os_server::main` reads
//! its `SEM_OS_*` vars, with an optional YAML file overlay for the options
//! that are awkward to set via env (none currently, but the hook exists
//! for parity with the rest of the workspace's `serde_yaml` usage).

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_MASTER_ADDRESS, ProtocolVersion};

fn default_client_address() -> u8 {
    DEFAULT_MASTER_ADDRESS
}

fn default_baud_rate() -> u32 {
    38_400
}

fn default_interface() -> String {
    "/dev/ttyAMA0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_client_address")]
    pub client_address: u8,
    #[serde(default = "default_baud_rate")]
    pub client_baud_rate: u32,
    #[serde(default = "default_interface")]
    pub client_interface: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_address: default_client_address(),
            client_baud_rate: default_baud_rate(),
            client_interface: default_interface(),
        }
    }
}

impl GatewayConfig {
    /// Protocol version is fixed at V1 (spec §6); surfaced as a method
    /// rather than a field so there's nothing to misconfigure.
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    /// Read configuration from environment variables, falling back to the
    /// spec-documented defaults for anything unset.
    ///
    /// Recognised vars: `FB_BUS_CLIENT_ADDRESS`, `FB_BUS_CLIENT_BAUD_RATE`,
    /// `FB_BUS_CLIENT_INTERFACE`.
    pub fn from_env() -> Self {
        let client_address = std::env::var("FB_BUS_CLIENT_ADDRESS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_client_address);

        let client_baud_rate = std::env::var("FB_BUS_CLIENT_BAUD_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_baud_rate);

        let client_interface =
            std::env::var("FB_BUS_CLIENT_INTERFACE").unwrap_or_else(|_| default_interface());

        Self {
            client_address,
            client_baud_rate,
            client_interface,
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}
