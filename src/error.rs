use thiserror::Error;

use crate::parse::FrameDecodeError;

/// Failure classes of the gateway core.
///
/// Device- and frame-level variants are translated into log lines or outward
/// connection events before they reach the bus; only
/// [`GatewayError::UnroutableMessage`] is ever returned from
/// [`crate::bus::MessageBus::handle`] in normal wiring.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The scan found no peripheral whose name contains the requested id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The peripheral was found but the link did not come up.
    #[error("could not connect to {device_id}: {reason}")]
    DeviceConnect { device_id: String, reason: String },

    /// A control frame was addressed to a device with no live handle.
    #[error("device {0} is not connected")]
    UnknownDevice(String),

    /// The backend connection closed; the bridge reconnects.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error(transparent)]
    FrameDecode(#[from] FrameDecodeError),

    /// Inbound envelope with an unknown tag or malformed payload.
    #[error("cannot decode envelope: {0}")]
    EnvelopeDecode(String),

    #[error("write to {device_id} failed: {reason}")]
    RadioWrite { device_id: String, reason: String },

    /// No handler is registered for this message kind.
    #[error("no handler registered for {0}")]
    UnroutableMessage(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
