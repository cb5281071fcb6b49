//! GATT UUIDs, device-facing control frames, and unit conversions for the
//! UWB ranging tags.
//!
//! All UUIDs belong to the tag firmware's vendor namespace
//! `6ba1de6b-3ab6-4d77-9ea1-cb642272XXXX`.

use serde::Serialize;
use uuid::Uuid;

use crate::types::MeasurementType;

// ── Characteristics ───────────────────────────────────────────────────────────

/// Ranging result notifications.  Every payload is one fixed-layout frame;
/// see [`crate::parse::decode`].
pub const NOTIFY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6ba1de6b_3ab6_4d77_9ea1_cb6422720001);

/// Raw single-byte command channel.  Not used by the gateway's session flow.
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6ba1de6b_3ab6_4d77_9ea1_cb6422720002);

/// Measurement control channel (`measurement_msg` start / stop frames).
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6ba1de6b_3ab6_4d77_9ea1_cb6422720003);

/// JSON session setup channel (`setup_msg` frames).
pub const SETUP_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6ba1de6b_3ab6_4d77_9ea1_cb6422720004);

// ── Antenna delay ─────────────────────────────────────────────────────────────

/// Firmware antenna delay, in ticks, used when a command carries no delay.
pub const DEFAULT_ANTENNA_DELAY_TICKS: u32 = 16385;

/// Ticks per [`ANTENNA_DELAY_REFERENCE_SECONDS`].
const ANTENNA_DELAY_REFERENCE_TICKS: f64 = 63898.0;
const ANTENNA_DELAY_REFERENCE_SECONDS: f64 = 1.026e-6;

/// Convert an antenna delay in seconds into device clock ticks:
/// `round((seconds / 1.026e-6) * 63898)`.
///
/// The firmware applies the same formula, so the result must match it bit for
/// bit; negative input saturates to `0`.
///
/// ```
/// # use uwb_gateway::protocol::antenna_delay_ticks;
/// assert_eq!(antenna_delay_ticks(0.0), 0);
/// assert_eq!(antenna_delay_ticks(1.026e-6), 63898);
/// ```
pub fn antenna_delay_ticks(seconds: f64) -> u32 {
    ((seconds / ANTENNA_DELAY_REFERENCE_SECONDS) * ANTENNA_DELAY_REFERENCE_TICKS).round() as u32
}

/// Ticks for an optional delay, falling back to [`DEFAULT_ANTENNA_DELAY_TICKS`].
pub fn antenna_delay_or_default(seconds: Option<f64>) -> u32 {
    seconds.map_or(DEFAULT_ANTENNA_DELAY_TICKS, antenna_delay_ticks)
}

// ── Responder ids ─────────────────────────────────────────────────────────────

/// Embedded firmware numbers responders from 100 upwards.
pub const RESPONDER_ID_OFFSET: u16 = 100;

/// Index into the session's responder list for a firmware responder id.
pub fn responder_index(responder_id: u16) -> usize {
    (responder_id % RESPONDER_ID_OFFSET) as usize
}

// ── Control frames ────────────────────────────────────────────────────────────

/// Role a device plays in a session, as written into `setup_msg.device_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceRole {
    #[serde(rename = "initiator")]
    Initiator,
    #[serde(rename = "responder")]
    Responder,
    /// Triplet calibration positions.
    A,
    B,
    C,
}

/// `{"type":"measurement_msg","command":"start"|"stop"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeasurementMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    command: &'static str,
}

impl MeasurementMessage {
    pub fn start() -> Self {
        Self { kind: "measurement_msg", command: "start" }
    }

    pub fn stop() -> Self {
        Self { kind: "measurement_msg", command: "stop" }
    }
}

/// Session setup pushed to every participant before a measurement starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    pub device_type: DeviceRole,
    pub initiator_device: String,
    /// Number of initiators; always one.
    pub initiator: u8,
    pub responder_device: Vec<String>,
    /// Number of responders.
    pub responder: usize,
    pub min_measurement: u32,
    pub max_measurement: u32,
    pub measurement_type: MeasurementType,
    pub rx_ant_dly: u32,
    pub tx_ant_dly: u32,
}

impl SetupMessage {
    pub fn new(
        device_type: DeviceRole,
        initiator_device: &str,
        responder_device: &[String],
        measurement_type: MeasurementType,
    ) -> Self {
        Self {
            kind: "setup_msg",
            device_type,
            initiator_device: initiator_device.to_owned(),
            initiator: 1,
            responder_device: responder_device.to_vec(),
            responder: responder_device.len(),
            min_measurement: 0,
            max_measurement: 0,
            measurement_type,
            rx_ant_dly: DEFAULT_ANTENNA_DELAY_TICKS,
            tx_ant_dly: DEFAULT_ANTENNA_DELAY_TICKS,
        }
    }

    pub fn with_bounds(mut self, min_measurement: u32, max_measurement: u32) -> Self {
        self.min_measurement = min_measurement;
        self.max_measurement = max_measurement;
        self
    }

    pub fn with_antenna_delays(mut self, rx_ticks: u32, tx_ticks: u32) -> Self {
        self.rx_ant_dly = rx_ticks;
        self.tx_ant_dly = tx_ticks;
        self
    }
}

/// Serialise a control frame for a write characteristic.
pub fn encode_frame<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(frame)
}
