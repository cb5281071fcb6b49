use serde::{Deserialize, Serialize};

/// Ranging algorithm run by the tags.  Commands that omit it get `ds_twr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    /// Single-sided two-way ranging.
    SsTwr,
    /// Double-sided two-way ranging.
    #[default]
    DsTwr,
}

impl MeasurementType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SsTwr => "ss_twr",
            Self::DsTwr => "ds_twr",
        }
    }
}

/// One decoded two-device ranging result.
///
/// Layouts `Standard` and `StandardExtended` both decode into this struct; the
/// older `Standard` layout carries no link-quality block, so `nlos`, `rssi`
/// and `fpi` are zero for it.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardFrame {
    /// Message tag written by the firmware (e.g. `"dstwr"`), right-trimmed.
    pub msg_type: String,
    /// Firmware state tag (e.g. `"result"`), right-trimmed.
    pub state: String,
    /// Firmware responder id; responders are numbered from 100.
    pub responder_id: u16,
    pub sequence: u32,
    /// Running measurement count within the session.
    pub measurement: u32,
    /// Distance in metres.
    pub distance: f32,
    pub time_round_1: f32,
    pub time_round_2: f32,
    pub time_reply_1: f32,
    pub time_reply_2: f32,
    pub nlos: u16,
    pub rssi: f32,
    pub fpi: f32,
}

/// The ten intermediate clock-offset timestamps of a triplet exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TripletTimestamps {
    pub time_m21: f32,
    pub time_m31: f32,
    pub time_a21: f32,
    pub time_a31: f32,
    pub time_b21: f32,
    pub time_b31: f32,
    pub time_tc_i: f32,
    pub time_tc_ii: f32,
    pub time_tb_i: f32,
    pub time_tb_ii: f32,
}

/// One decoded three-device calibration result.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletFrame {
    pub msg_type: String,
    pub sequence: u32,
    pub measurement: u32,
    pub timestamps: TripletTimestamps,
    pub time_round_1: f32,
    pub time_round_2: f32,
    pub time_reply_1: f32,
    pub time_reply_2: f32,
    pub distance: f32,
}

/// A ranging notification decoded by [`crate::parse::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum RangingFrame {
    Standard(StandardFrame),
    Triplet(TripletFrame),
}

impl RangingFrame {
    /// Running measurement count, shared by both variants.
    pub fn measurement(&self) -> u32 {
        match self {
            Self::Standard(f) => f.measurement,
            Self::Triplet(f) => f.measurement,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Self::Standard(f) => f.sequence,
            Self::Triplet(f) => f.sequence,
        }
    }
}
