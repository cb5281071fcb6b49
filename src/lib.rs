//! # uwb-gateway
//!
//! Field gateway between UWB two-way-ranging tags, reached over Bluetooth Low
//! Energy, and a WebSocket coordination backend.
//!
//! The backend sends commands (connect a tag, start a distance measurement,
//! run a calibration schedule).  The gateway pushes setup and control frames
//! to the tags, listens to their ranging notifications, decodes the binary
//! frames and reports typed measurement events back.
//!
//! ## Running
//!
//! ```text
//! RUST_LOG=info uwb-gateway --backend ws://192.168.0.101:8000/ws/sit/1
//! ```
//!
//! ## Embedding
//!
//! ```no_run
//! use std::sync::Arc;
//! use uwb_gateway::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = GatewayConfig::default();
//! let (inbox, mut inbox_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (outbound, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let radio = Arc::new(BtleRadio::new().await?);
//! let registry = DeviceRegistry::new(radio, inbox, &config);
//! let mut bus = build_bus(GatewayDeps {
//!     orchestrator: MeasurementOrchestrator::new(registry, &config),
//!     outbound,
//!     client_id: config.client_id.clone(),
//! });
//!
//! TransportBridge::new(WebSocketTransport, &config)
//!     .run(&mut bus, &mut inbox_rx, &mut outbound_rx)
//!     .await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`parse`] | Fixed-layout ranging frame codec |
//! | [`types`] | Decoded frame types and the measurement-type tag |
//! | [`protocol`] | GATT UUIDs, setup / control frames, antenna delay conversion |
//! | [`radio`] | [`radio::Radio`] seam and its btleplug implementation |
//! | [`registry`] | Connected devices and keyed background tasks |
//! | [`calibration`] | Pairwise / triplet schedules and the round queue |
//! | [`orchestrator`] | Measurement session state machine |
//! | [`messages`] | Commands and events |
//! | [`bus`] | Single-consumer command / event dispatcher |
//! | [`envelope`] | Backend JSON envelopes |
//! | [`transport`] | Backend connection and the bus-driving loop |
//! | [`gateway`] | Handler wiring |

pub mod bus;
pub mod calibration;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod orchestrator;
pub mod parse;
pub mod protocol;
pub mod radio;
pub mod registry;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for the binary and embedding crates.
pub mod prelude {
    // ── Wiring ────────────────────────────────────────────────────────────────
    pub use crate::bus::{Inbox, MessageBus, Outbox};
    pub use crate::config::GatewayConfig;
    pub use crate::gateway::{build_bus, GatewayBus, GatewayDeps};
    pub use crate::orchestrator::MeasurementOrchestrator;
    pub use crate::registry::DeviceRegistry;

    // ── Collaborators ─────────────────────────────────────────────────────────
    pub use crate::radio::{BtleRadio, Radio};
    pub use crate::transport::{Transport, TransportBridge, WebSocketTransport};

    // ── Messages and data ─────────────────────────────────────────────────────
    pub use crate::error::{GatewayError, Result};
    pub use crate::messages::{Command, Event, Message};
    pub use crate::types::{MeasurementType, RangingFrame, StandardFrame, TripletFrame};
}
