use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use uwb_gateway::prelude::*;

/// Bridge UWB ranging tags over BLE to a WebSocket backend.
#[derive(Parser, Debug)]
#[command(name = "uwb-gateway", version, about)]
struct Cli {
    /// Backend WebSocket endpoint
    #[arg(long, env = "UWB_GATEWAY_BACKEND", default_value = "ws://127.0.0.1:8000/ws/sit/1")]
    backend: String,
    /// Client id announced on every (re)connect
    #[arg(long, env = "UWB_GATEWAY_CLIENT_ID", default_value = "PI_Home")]
    client_id: String,
    /// BLE scan duration per connect request, seconds
    #[arg(long, env = "UWB_GATEWAY_SCAN_TIMEOUT", default_value_t = 20.0)]
    scan_timeout: f64,
    /// Wait after connecting before the link check, seconds
    #[arg(long, env = "UWB_GATEWAY_CONNECT_SETTLE", default_value_t = 5.0)]
    connect_settle: f64,
    /// Wait between setup and start frames, seconds
    #[arg(long, env = "UWB_GATEWAY_SESSION_SETTLE", default_value_t = 3.0)]
    session_settle: f64,
    /// Link poll interval, seconds
    #[arg(long, env = "UWB_GATEWAY_KEEPALIVE", default_value_t = 5.0)]
    keepalive: f64,
    /// Pause before reconnecting to the backend, seconds
    #[arg(long, env = "UWB_GATEWAY_RECONNECT_DELAY", default_value_t = 2.0)]
    reconnect_delay: f64,
}

impl Cli {
    fn into_config(self) -> Result<GatewayConfig> {
        let secs = |name: &str, v: f64| {
            Duration::try_from_secs_f64(v).map_err(|e| anyhow::anyhow!("--{name}: {e}"))
        };
        Ok(GatewayConfig {
            scan_timeout: secs("scan-timeout", self.scan_timeout)?,
            connect_settle: secs("connect-settle", self.connect_settle)?,
            session_settle: secs("session-settle", self.session_settle)?,
            keepalive_interval: secs("keepalive", self.keepalive)?,
            reconnect_delay: secs("reconnect-delay", self.reconnect_delay)?,
            backend_uri: self.backend,
            client_id: self.client_id,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    //   RUST_LOG=uwb_gateway=debug uwb-gateway …
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;

    // ── Wiring ────────────────────────────────────────────────────────────────
    let (inbox, mut inbox_rx) = tokio::sync::mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();

    let radio = Arc::new(BtleRadio::new().await?);
    let registry = DeviceRegistry::new(radio, inbox, &config);
    let mut bus = build_bus(GatewayDeps {
        orchestrator: MeasurementOrchestrator::new(registry, &config),
        outbound,
        client_id: config.client_id.clone(),
    });
    let bridge = TransportBridge::new(WebSocketTransport, &config);

    // ── Run until Ctrl-C ──────────────────────────────────────────────────────
    info!("gateway {} starting, backend {}", config.client_id, config.backend_uri);
    tokio::select! {
        _ = bridge.run(&mut bus, &mut inbox_rx, &mut outbound_rx) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("interrupted, shutting down");
        }
    }

    bus.deps_mut().orchestrator.shutdown().await;
    info!("all devices released");
    Ok(())
}
