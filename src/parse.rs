//! Binary decoder for UWB ranging notifications.
//!
//! Every notification on [`crate::protocol::NOTIFY_CHARACTERISTIC`] carries one
//! C struct written by the tag firmware.  The layout is picked **only** by the
//! exact payload length; a length that matches no registered layout is an
//! error, never a best-effort partial decode.
//!
//! # Layouts
//!
//! All fields are little-endian with natural C alignment.
//!
//! | Layout | Size | Contents |
//! |---|---|---|
//! | [`FrameLayout::StandardExtended`] | 72 B | standard result + RSSI, FPI, NLOS |
//! | [`FrameLayout::Standard`] | 60 B | `msg_type[15] state[15] u16 u32 u32 f32×5` |
//! | [`FrameLayout::Triplet`] | 88 B | `msg_type[15] pad u32 u32 f32×15 u32` |
//!
//! [`LAYOUT_PRIORITY`] lists the layouts newest first; if two layouts ever end
//! up with the same size, the earlier entry wins.

use thiserror::Error;

use crate::types::{RangingFrame, StandardFrame, TripletFrame, TripletTimestamps};

/// The payload length matched none of the registered layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ranging frame of {actual_length} bytes matches no known layout")]
pub struct FrameDecodeError {
    pub actual_length: usize,
}

/// Wire layouts understood by [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// Current firmware: standard result plus link-quality block.
    StandardExtended,
    /// Older firmware without RSSI / FPI / NLOS.
    Standard,
    /// Three-device calibration result.
    Triplet,
}

impl FrameLayout {
    /// Total payload size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::StandardExtended => 72,
            Self::Standard => 60,
            Self::Triplet => 88,
        }
    }
}

/// Layout lookup order, newest first.
pub const LAYOUT_PRIORITY: [FrameLayout; 3] = [
    FrameLayout::StandardExtended,
    FrameLayout::Standard,
    FrameLayout::Triplet,
];

/// Width of the fixed character fields (`char[15]`).
const TEXT_FIELD: usize = 15;

/// Select the layout for a payload of `len` bytes.
pub fn layout_for_length(len: usize) -> Option<FrameLayout> {
    LAYOUT_PRIORITY.iter().copied().find(|l| l.size() == len)
}

/// Decode one notification payload.
///
/// # Errors
/// [`FrameDecodeError`] when `data.len()` is not exactly one of the layout sizes.
pub fn decode(data: &[u8]) -> Result<RangingFrame, FrameDecodeError> {
    let layout = layout_for_length(data.len()).ok_or(FrameDecodeError {
        actual_length: data.len(),
    })?;
    // Every offset below is in bounds: `data.len() == layout.size()`.
    let r = Reader(data);
    Ok(match layout {
        FrameLayout::Standard | FrameLayout::StandardExtended => {
            let extended = layout == FrameLayout::StandardExtended;
            RangingFrame::Standard(StandardFrame {
                msg_type: r.text(0),
                state: r.text(TEXT_FIELD),
                responder_id: r.u16(30),
                sequence: r.u32(32),
                measurement: r.u32(36),
                distance: r.f32(40),
                time_round_1: r.f32(44),
                time_round_2: r.f32(48),
                time_reply_1: r.f32(52),
                time_reply_2: r.f32(56),
                rssi: if extended { r.f32(60) } else { 0.0 },
                fpi: if extended { r.f32(64) } else { 0.0 },
                // 68..70 is reserved by the firmware.
                nlos: if extended { r.u16(70) } else { 0 },
            })
        }
        FrameLayout::Triplet => RangingFrame::Triplet(TripletFrame {
            msg_type: r.text(0),
            sequence: r.u32(16),
            measurement: r.u32(20),
            timestamps: TripletTimestamps {
                time_m21: r.f32(24),
                time_m31: r.f32(28),
                time_a21: r.f32(32),
                time_a31: r.f32(36),
                time_b21: r.f32(40),
                time_b31: r.f32(44),
                time_tc_i: r.f32(48),
                time_tc_ii: r.f32(52),
                time_tb_i: r.f32(56),
                time_tb_ii: r.f32(60),
            },
            time_round_1: r.f32(64),
            time_round_2: r.f32(68),
            time_reply_1: r.f32(72),
            time_reply_2: r.f32(76),
            distance: r.f32(80),
        }),
    })
}

/// Encode a frame in the layout the current firmware emits.
///
/// Standard frames are written as [`FrameLayout::StandardExtended`]; text
/// fields longer than 15 bytes are truncated.  Used to build fixtures and to
/// replay captured sessions.
pub fn encode(frame: &RangingFrame) -> Vec<u8> {
    match frame {
        RangingFrame::Standard(f) => {
            let mut w = Writer::new(FrameLayout::StandardExtended.size());
            w.text(0, &f.msg_type);
            w.text(TEXT_FIELD, &f.state);
            w.u16(30, f.responder_id);
            w.u32(32, f.sequence);
            w.u32(36, f.measurement);
            for (i, v) in [
                f.distance,
                f.time_round_1,
                f.time_round_2,
                f.time_reply_1,
                f.time_reply_2,
                f.rssi,
                f.fpi,
            ]
            .into_iter()
            .enumerate()
            {
                w.f32(40 + 4 * i, v);
            }
            w.u16(70, f.nlos);
            w.0
        }
        RangingFrame::Triplet(f) => {
            let mut w = Writer::new(FrameLayout::Triplet.size());
            let t = &f.timestamps;
            w.text(0, &f.msg_type);
            w.u32(16, f.sequence);
            w.u32(20, f.measurement);
            for (i, v) in [
                t.time_m21,
                t.time_m31,
                t.time_a21,
                t.time_a31,
                t.time_b21,
                t.time_b31,
                t.time_tc_i,
                t.time_tc_ii,
                t.time_tb_i,
                t.time_tb_ii,
                f.time_round_1,
                f.time_round_2,
                f.time_reply_1,
                f.time_reply_2,
                f.distance,
            ]
            .into_iter()
            .enumerate()
            {
                w.f32(24 + 4 * i, v);
            }
            w.0
        }
    }
}

// ── Field access ──────────────────────────────────────────────────────────────

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.0[offset..offset + N]);
        out
    }

    fn u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.bytes(offset))
    }

    fn u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.bytes(offset))
    }

    fn f32(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.bytes(offset))
    }

    /// Fixed `char[15]` field: NUL padding and trailing whitespace are trimmed.
    fn text(&self, offset: usize) -> String {
        let raw = &self.0[offset..offset + TEXT_FIELD];
        String::from_utf8_lossy(raw)
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_owned()
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn new(size: usize) -> Self {
        Self(vec![0; size])
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, offset: usize, v: u16) {
        self.put(offset, &v.to_le_bytes());
    }

    fn u32(&mut self, offset: usize, v: u32) {
        self.put(offset, &v.to_le_bytes());
    }

    fn f32(&mut self, offset: usize, v: f32) {
        self.put(offset, &v.to_le_bytes());
    }

    fn text(&mut self, offset: usize, s: &str) {
        let bytes = s.as_bytes();
        self.put(offset, &bytes[..bytes.len().min(TEXT_FIELD)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> StandardFrame {
        StandardFrame {
            msg_type: "dstwr".into(),
            state: "result".into(),
            responder_id: 101,
            sequence: 7,
            measurement: 3,
            distance: 2.53,
            time_round_1: 1.5e-4,
            time_round_2: 2.5e-4,
            time_reply_1: 3.5e-4,
            time_reply_2: 4.5e-4,
            nlos: 1,
            rssi: -78.25,
            fpi: 742.5,
        }
    }

    fn triplet() -> TripletFrame {
        TripletFrame {
            msg_type: "simple".into(),
            sequence: 11,
            measurement: 12,
            timestamps: TripletTimestamps {
                time_m21: 1.0,
                time_m31: 2.0,
                time_a21: 3.0,
                time_a31: 4.0,
                time_b21: 5.0,
                time_b31: 6.0,
                time_tc_i: 7.0,
                time_tc_ii: 8.0,
                time_tb_i: 9.0,
                time_tb_ii: 10.0,
            },
            time_round_1: 11.0,
            time_round_2: 12.0,
            time_reply_1: 13.0,
            time_reply_2: 14.0,
            distance: 1.75,
        }
    }

    #[test]
    fn layout_sizes_are_unique() {
        for (i, a) in LAYOUT_PRIORITY.iter().enumerate() {
            for b in &LAYOUT_PRIORITY[i + 1..] {
                assert_ne!(a.size(), b.size(), "{a:?} and {b:?} collide");
            }
        }
    }

    #[test]
    fn unknown_lengths_are_rejected() {
        for len in [0, 1, 59, 61, 71, 73, 87, 89, 128] {
            assert_eq!(
                decode(&vec![0u8; len]),
                Err(FrameDecodeError { actual_length: len })
            );
        }
    }

    #[test]
    fn standard_frame_survives_encoding() {
        let frame = standard();
        let bytes = encode(&RangingFrame::Standard(frame.clone()));
        assert_eq!(bytes.len(), 72);
        let RangingFrame::Standard(got) = decode(&bytes).unwrap() else {
            panic!("expected a standard frame");
        };
        assert_eq!(got.msg_type, "dstwr");
        assert_eq!(got.state, "result");
        assert_eq!(got.responder_id, 101);
        assert_eq!(got.sequence, 7);
        assert_eq!(got.measurement, 3);
        assert!((got.distance - 2.53).abs() < 1e-6);
        assert!((got.rssi + 78.25).abs() < 1e-6);
        assert_eq!(got.nlos, 1);
        assert_eq!(got, frame);
    }

    #[test]
    fn legacy_standard_layout_has_no_link_quality() {
        let bytes = encode(&RangingFrame::Standard(standard()));
        let RangingFrame::Standard(got) = decode(&bytes[..60]).unwrap() else {
            panic!("expected a standard frame");
        };
        assert_eq!(got.sequence, 7);
        assert!((got.time_reply_2 - 4.5e-4).abs() < 1e-9);
        assert_eq!((got.nlos, got.rssi, got.fpi), (0, 0.0, 0.0));
    }

    #[test]
    fn triplet_frame_survives_encoding() {
        let frame = triplet();
        let bytes = encode(&RangingFrame::Triplet(frame.clone()));
        assert_eq!(bytes.len(), 88);
        assert_eq!(decode(&bytes).unwrap(), RangingFrame::Triplet(frame));
    }

    #[test]
    fn text_fields_are_right_trimmed() {
        let mut bytes = encode(&RangingFrame::Standard(standard()));
        bytes[..TEXT_FIELD].copy_from_slice(b"dstwr  \0\0\0\0\0\0\0\0");
        let RangingFrame::Standard(got) = decode(&bytes).unwrap() else {
            panic!("expected a standard frame");
        };
        assert_eq!(got.msg_type, "dstwr");
    }

    #[test]
    fn byte_order_is_little_endian() {
        let mut bytes = vec![0u8; 60];
        bytes[32..36].copy_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        bytes[30..32].copy_from_slice(&[0x64, 0x00]);
        let RangingFrame::Standard(got) = decode(&bytes).unwrap() else {
            panic!("expected a standard frame");
        };
        assert_eq!(got.sequence, 1);
        assert_eq!(got.responder_id, 100);
    }
}
