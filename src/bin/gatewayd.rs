//! gatewayd — standalone FB BUS gateway process.
//!
//! Reads config from env vars:
//!   FB_BUS_CLIENT_ADDRESS    — this gateway's bus address (default: 254)
//!   FB_BUS_CLIENT_BAUD_RATE  — serial baud rate (default: 38400)
//!   FB_BUS_CLIENT_INTERFACE  — serial device path (default: /dev/ttyAMA0)
//!   FB_BUS_TICK_INTERVAL_MS  — orchestrator tick cadence (default: 200)

use std::time::Duration;

use fb_bus_gateway::config::GatewayConfig;
use fb_bus_gateway::connector::Connector;
use fb_bus_gateway::link::NullLink;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fb_bus_gateway=debug".into()),
        )
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!(
        address = config.client_address,
        baud_rate = config.client_baud_rate,
        interface = %config.client_interface,
        "starting FB BUS gateway"
    );

    let tick_interval_ms: u64 = std::env::var("FB_BUS_TICK_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(200);

    // NullLink stands in for the real PJON serial driver, which lives
    // outside this crate's scope.
    let mut connector = Connector::new(config, Box::new(NullLink::new()));
    connector.start();
    connector.enable_client();

    connector.run_forever(Duration::from_millis(tick_interval_ms)).await;
}
