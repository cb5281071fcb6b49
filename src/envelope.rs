//! JSON envelopes exchanged with the coordination backend.
//!
//! Every frame on the socket is `{"type": <tag>, "data": {...}}`.  Inbound tags
//! are resolved through a static table of decoders; outbound events are mapped
//! onto the shapes the backend's persistence layer expects.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{GatewayError, Result};
use crate::messages::{
    Command, DeviceFailure, DeviceStatus, Event, Measurement, Message, RegisterClient,
};

/// Wire tags.
pub mod tag {
    pub const REGISTER_CLIENT: &str = "RegisterWsClient";
    pub const PING: &str = "PingWsConnection";
    pub const CONNECT_DEVICE: &str = "ConnectBleDevice";
    pub const DISCONNECT_DEVICE: &str = "DisconnectBleDevice";
    pub const START_DISTANCE: &str = "StartDistanceMeasurement";
    pub const STOP_DISTANCE: &str = "StopDistanceMeasurement";
    pub const START_TEST: &str = "StartTestMeasurement";
    pub const START_CALIBRATION: &str = "StartCalibrationMeasurement";
    pub const START_SIMPLE_CALIBRATION: &str = "StartSimpleCalibrationMeasurement";
    pub const START_DEBUG_CALIBRATION: &str = "StartDebugCalibrationMeasurement";

    pub const DEVICE_CONNECTED: &str = "BleDeviceConnected";
    pub const DEVICE_DISCONNECTED: &str = "BleDeviceDisconnected";
    pub const CONNECT_FAILED: &str = "BleDeviceConnectFailed";
    pub const CONNECT_ERROR: &str = "BleDeviceConnectError";
    pub const TEST_FINISHED: &str = "TestMeasurementFinished";
    pub const CALIBRATION_FINISHED: &str = "CalibrationMeasurementFinished";
    pub const SIMPLE_CALIBRATION_FINISHED: &str = "SimpleCalibrationMeasurementFinished";

    pub const REGISTER_CONNECTION: &str = "RegisterBleConnection";
    pub const UNREGISTER_CONNECTION: &str = "UnregisterBleConnection";
    /// Spelled the way the backend spells it.
    pub const SAVE_MEASUREMENT: &str = "SaveMesurement";
    pub const SAVE_TEST_MEASUREMENT: &str = "SaveTestMeasurement";
    pub const SAVE_CALIBRATION_MEASUREMENT: &str = "SaveCalibrationMeasurement";
    pub const SAVE_SIMPLE_CALIBRATION_MEASUREMENT: &str = "SaveSimpleCalibrationMeasurement";
}

// ── Inbound ───────────────────────────────────────────────────────────────────

type Decoder = fn(Value) -> serde_json::Result<Message>;

fn payload<T: DeserializeOwned>(data: Value) -> serde_json::Result<T> {
    serde_json::from_value(data)
}

/// Tag → decoder for every message the backend may send.
static DECODERS: &[(&str, Decoder)] = &[
    (tag::REGISTER_CLIENT, |d| Ok(Command::RegisterClient(payload(d)?).into())),
    (tag::PING, |_| Ok(Command::Ping.into())),
    (tag::CONNECT_DEVICE, |d| Ok(Command::ConnectDevice(payload(d)?).into())),
    (tag::DISCONNECT_DEVICE, |d| Ok(Command::DisconnectDevice(payload(d)?).into())),
    (tag::START_DISTANCE, |d| Ok(Command::StartDistanceMeasurement(payload(d)?).into())),
    (tag::STOP_DISTANCE, |_| Ok(Command::StopDistanceMeasurement.into())),
    (tag::START_TEST, |d| Ok(Command::StartTestMeasurement(payload(d)?).into())),
    (tag::START_CALIBRATION, |d| Ok(Command::StartCalibration(payload(d)?).into())),
    (tag::START_SIMPLE_CALIBRATION, |d| Ok(Command::StartSimpleCalibration(payload(d)?).into())),
    (tag::START_DEBUG_CALIBRATION, |d| Ok(Command::StartDebugCalibration(payload(d)?).into())),
    (tag::DEVICE_CONNECTED, |d| Ok(Event::DeviceConnected(payload(d)?).into())),
    (tag::DEVICE_DISCONNECTED, |d| Ok(Event::DeviceDisconnected(payload(d)?).into())),
    (tag::CONNECT_FAILED, |d| Ok(Event::ConnectFailed(payload(d)?).into())),
    (tag::CONNECT_ERROR, |d| Ok(Event::ConnectError(payload(d)?).into())),
    (tag::TEST_FINISHED, |d| Ok(Event::TestFinished(payload(d)?).into())),
    (tag::CALIBRATION_FINISHED, |d| Ok(Event::CalibrationFinished(payload(d)?).into())),
    (tag::SIMPLE_CALIBRATION_FINISHED, |d| Ok(Event::SimpleCalibrationFinished(payload(d)?).into())),
];

/// Decode one inbound text frame.  A missing or `null` `data` is treated as
/// an empty object.
///
/// # Errors
/// [`GatewayError::EnvelopeDecode`] for invalid JSON, a missing or unknown
/// `type`, or a `data` object that does not fit the tag's payload.
pub fn decode(text: &str) -> Result<Message> {
    let bad = GatewayError::EnvelopeDecode;

    let mut frame: Value = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
    let tag = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("missing \"type\"".into()))?
        .to_owned();
    let data = match frame.get_mut("data").map(Value::take) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(data) => data,
    };

    let (_, decoder) = DECODERS
        .iter()
        .find(|(t, _)| *t == tag)
        .ok_or_else(|| bad(format!("unknown type {tag:?}")))?;
    decoder(data).map_err(|e| bad(format!("{tag}: {e}")))
}

// ── Outbound ──────────────────────────────────────────────────────────────────

fn envelope(tag: &str, data: impl Serialize) -> Value {
    json!({ "type": tag, "data": data })
}

/// `RegisterWsClient` envelope announcing this gateway.
pub fn registration(client_id: &str) -> Value {
    envelope(
        tag::REGISTER_CLIENT,
        RegisterClient { client_id: client_id.to_owned() },
    )
}

fn measurement_data(m: &Measurement) -> Value {
    json!({
        "initiator": m.initiator,
        "responder": m.responder,
        "measurement_type": m.measurement_type,
        "sequence": m.sequence,
        "measurement": m.measurement,
        "distance": m.distance,
        "time_round_1": m.time_round_1,
        "time_round_2": m.time_round_2,
        "time_reply_1": m.time_reply_1,
        "time_reply_2": m.time_reply_2,
        "nlos": m.nlos,
        "rssi": m.rssi,
        "fpi": m.fpi,
    })
}

fn status(device: &DeviceStatus) -> Value {
    json!({ "device_id": device.device_id })
}

/// Backend envelope for an outward event.
///
/// Connection state becomes `Register/UnregisterBleConnection`, measurements
/// become `Save*` records, failures and finished markers go out in their own
/// shape.
pub fn backend(event: &Event) -> Value {
    match event {
        Event::DeviceConnected(d) => envelope(tag::REGISTER_CONNECTION, status(d)),
        Event::DeviceDisconnected(d) => envelope(tag::UNREGISTER_CONNECTION, status(d)),
        Event::ConnectFailed(f) => envelope(tag::CONNECT_FAILED, f),
        Event::ConnectError(f) => envelope(tag::CONNECT_ERROR, f),
        Event::DistanceMeasurement(m) => envelope(tag::SAVE_MEASUREMENT, measurement_data(m)),
        Event::TestMeasurement(t) => {
            let mut data = measurement_data(&t.measurement);
            data["test_id"] = json!(t.test_id);
            envelope(tag::SAVE_TEST_MEASUREMENT, data)
        }
        Event::CalibrationMeasurement(c) => {
            let mut data = measurement_data(&c.measurement);
            data["calibration_id"] = json!(c.calibration_id);
            envelope(tag::SAVE_CALIBRATION_MEASUREMENT, data)
        }
        Event::SimpleCalibrationMeasurement(s) => {
            let t = &s.timestamps;
            envelope(
                tag::SAVE_SIMPLE_CALIBRATION_MEASUREMENT,
                json!({
                    "calibration_id": s.calibration_id,
                    "sequence": s.sequence,
                    "measurement": s.measurement,
                    "device_a": s.devices[0],
                    "device_b": s.devices[1],
                    "device_c": s.devices[2],
                    "time_m21": t.time_m21,
                    "time_m31": t.time_m31,
                    "time_a21": t.time_a21,
                    "time_a31": t.time_a31,
                    "time_b21": t.time_b21,
                    "time_b31": t.time_b31,
                    "time_tc_i": t.time_tc_i,
                    "time_tc_ii": t.time_tc_ii,
                    "time_tb_i": t.time_tb_i,
                    "time_tb_ii": t.time_tb_ii,
                    "time_round_1": s.time_round_1,
                    "time_round_2": s.time_round_2,
                    "time_reply_1": s.time_reply_1,
                    "time_reply_2": s.time_reply_2,
                    "distance": s.distance,
                }),
            )
        }
        Event::TestFinished(f) => envelope(tag::TEST_FINISHED, f),
        Event::CalibrationFinished(f) => envelope(tag::CALIBRATION_FINISHED, f),
        Event::SimpleCalibrationFinished(f) => envelope(tag::SIMPLE_CALIBRATION_FINISHED, f),
    }
}
