//! Commands and events flowing through the [`crate::bus::MessageBus`].
//!
//! Command payloads deserialize straight from the backend's `data` objects, so
//! their serde names are the backend's field names (`responder`,
//! `max_measurement`, `rx_ant_dly`, …), not the Rust field names.

use serde::{Deserialize, Serialize};

use crate::types::{MeasurementType, RangingFrame, TripletTimestamps};

// ── Command payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClient {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartDistanceMeasurement {
    pub initiator: String,
    #[serde(rename = "responder")]
    pub responders: Vec<String>,
    #[serde(default)]
    pub measurement_type: MeasurementType,
    /// Seconds.
    #[serde(rename = "rx_ant_dly", default)]
    pub rx_delay: Option<f64>,
    /// Seconds.
    #[serde(rename = "tx_ant_dly", default)]
    pub tx_delay: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartTestMeasurement {
    pub test_id: u64,
    pub initiator: String,
    #[serde(rename = "responder")]
    pub responders: Vec<String>,
    #[serde(rename = "min_measurement", default)]
    pub min_count: u32,
    #[serde(rename = "max_measurement")]
    pub max_count: u32,
    #[serde(default)]
    pub measurement_type: MeasurementType,
    #[serde(rename = "initiator_rx_ant_dly", default)]
    pub initiator_rx_delay: Option<f64>,
    #[serde(rename = "initiator_tx_ant_dly", default)]
    pub initiator_tx_delay: Option<f64>,
    #[serde(rename = "responder_rx_ant_dly", default)]
    pub responder_rx_delay: Option<f64>,
    #[serde(rename = "responder_tx_ant_dly", default)]
    pub responder_tx_delay: Option<f64>,
}

/// Payload of both pairwise and triplet calibration requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartCalibration {
    pub calibration_id: u64,
    pub devices: Vec<String>,
    #[serde(rename = "max_measurement")]
    pub max_count: u32,
    #[serde(default)]
    pub measurement_type: MeasurementType,
    #[serde(rename = "rx_ant_dly", default)]
    pub rx_delay: Option<f64>,
    #[serde(rename = "tx_ant_dly", default)]
    pub tx_delay: Option<f64>,
}

/// Calibration restricted to `initiator` against each listed responder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartDebugCalibration {
    pub calibration_id: u64,
    pub initiator: String,
    #[serde(rename = "responder")]
    pub responders: Vec<String>,
    #[serde(rename = "max_measurement")]
    pub max_count: u32,
    #[serde(default)]
    pub measurement_type: MeasurementType,
    #[serde(rename = "rx_ant_dly", default)]
    pub rx_delay: Option<f64>,
    #[serde(rename = "tx_ant_dly", default)]
    pub tx_delay: Option<f64>,
}

/// A decoded frame handed from a listener task to the bus consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingNotification {
    pub device_id: String,
    /// Generation of the session whose listener decoded the frame.
    pub session: u64,
    pub frame: RangingFrame,
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RegisterClient(RegisterClient),
    Ping,
    ConnectDevice(DeviceRequest),
    DisconnectDevice(DeviceRequest),
    StartDistanceMeasurement(StartDistanceMeasurement),
    StopDistanceMeasurement,
    StartTestMeasurement(StartTestMeasurement),
    StartCalibration(StartCalibration),
    StartSimpleCalibration(StartCalibration),
    StartDebugCalibration(StartDebugCalibration),
    /// Self-posted by the orchestrator between calibration rounds.
    AdvanceCalibrationRound,
    /// Posted by notify listeners; never decoded from the wire.
    RangingNotification(RangingNotification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RegisterClient,
    Ping,
    ConnectDevice,
    DisconnectDevice,
    StartDistanceMeasurement,
    StopDistanceMeasurement,
    StartTestMeasurement,
    StartCalibration,
    StartSimpleCalibration,
    StartDebugCalibration,
    AdvanceCalibrationRound,
    RangingNotification,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::RegisterClient(_) => CommandKind::RegisterClient,
            Self::Ping => CommandKind::Ping,
            Self::ConnectDevice(_) => CommandKind::ConnectDevice,
            Self::DisconnectDevice(_) => CommandKind::DisconnectDevice,
            Self::StartDistanceMeasurement(_) => CommandKind::StartDistanceMeasurement,
            Self::StopDistanceMeasurement => CommandKind::StopDistanceMeasurement,
            Self::StartTestMeasurement(_) => CommandKind::StartTestMeasurement,
            Self::StartCalibration(_) => CommandKind::StartCalibration,
            Self::StartSimpleCalibration(_) => CommandKind::StartSimpleCalibration,
            Self::StartDebugCalibration(_) => CommandKind::StartDebugCalibration,
            Self::AdvanceCalibrationRound => CommandKind::AdvanceCalibrationRound,
            Self::RangingNotification(_) => CommandKind::RangingNotification,
        }
    }
}

// ── Event payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub device_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// One two-device ranging result attributed to named devices.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub initiator: String,
    pub responder: String,
    pub measurement_type: MeasurementType,
    pub sequence: u32,
    /// Running measurement count within the session.
    pub measurement: u32,
    pub distance: f32,
    pub time_round_1: f32,
    pub time_round_2: f32,
    pub time_reply_1: f32,
    pub time_reply_2: f32,
    pub nlos: u16,
    pub rssi: f32,
    pub fpi: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestMeasurement {
    pub test_id: u64,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationMeasurement {
    pub calibration_id: u64,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleCalibrationMeasurement {
    pub calibration_id: u64,
    pub sequence: u32,
    pub measurement: u32,
    /// Devices in positions A, B, C.
    pub devices: [String; 3],
    pub timestamps: TripletTimestamps,
    pub time_round_1: f32,
    pub time_round_2: f32,
    pub time_reply_1: f32,
    pub time_reply_2: f32,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFinished {
    pub test_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationFinished {
    pub calibration_id: u64,
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceConnected(DeviceStatus),
    DeviceDisconnected(DeviceStatus),
    /// The scan did not find the device.
    ConnectFailed(DeviceFailure),
    /// The device was found but the link did not come up.
    ConnectError(DeviceFailure),
    DistanceMeasurement(Measurement),
    TestMeasurement(TestMeasurement),
    TestFinished(TestFinished),
    CalibrationMeasurement(CalibrationMeasurement),
    CalibrationFinished(CalibrationFinished),
    SimpleCalibrationMeasurement(SimpleCalibrationMeasurement),
    SimpleCalibrationFinished(CalibrationFinished),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceConnected,
    DeviceDisconnected,
    ConnectFailed,
    ConnectError,
    DistanceMeasurement,
    TestMeasurement,
    TestFinished,
    CalibrationMeasurement,
    CalibrationFinished,
    SimpleCalibrationMeasurement,
    SimpleCalibrationFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        Self::DeviceConnected,
        Self::DeviceDisconnected,
        Self::ConnectFailed,
        Self::ConnectError,
        Self::DistanceMeasurement,
        Self::TestMeasurement,
        Self::TestFinished,
        Self::CalibrationMeasurement,
        Self::CalibrationFinished,
        Self::SimpleCalibrationMeasurement,
        Self::SimpleCalibrationFinished,
    ];
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceConnected(_) => EventKind::DeviceConnected,
            Self::DeviceDisconnected(_) => EventKind::DeviceDisconnected,
            Self::ConnectFailed(_) => EventKind::ConnectFailed,
            Self::ConnectError(_) => EventKind::ConnectError,
            Self::DistanceMeasurement(_) => EventKind::DistanceMeasurement,
            Self::TestMeasurement(_) => EventKind::TestMeasurement,
            Self::TestFinished(_) => EventKind::TestFinished,
            Self::CalibrationMeasurement(_) => EventKind::CalibrationMeasurement,
            Self::CalibrationFinished(_) => EventKind::CalibrationFinished,
            Self::SimpleCalibrationMeasurement(_) => EventKind::SimpleCalibrationMeasurement,
            Self::SimpleCalibrationFinished(_) => EventKind::SimpleCalibrationFinished,
        }
    }

    /// Connection outcomes the gateway itself reports; inbound copies of these
    /// are echoes and must not be dispatched again.
    pub fn is_connection_outcome(&self) -> bool {
        matches!(
            self,
            Self::DeviceConnected(_) | Self::ConnectFailed(_) | Self::ConnectError(_)
        )
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Anything the bus can dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Event(Event),
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
