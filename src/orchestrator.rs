//! Measurement session state machine.
//!
//! ```text
//! Idle ──StartDistance──▶ Running(distance) ──Stop──▶ Idle
//! Idle ──StartTest──────▶ Running(test) ──count == max──▶ Idle  (+ TestFinished)
//! Idle ──StartCalibration──▶ PlanBuilt ──Advance──▶ Running(round) ──count == max──▶ PlanBuilt …
//!                                      └─Advance, queue empty──▶ Idle  (+ CalibrationFinished)
//! ```
//!
//! Every method runs on the bus consumer, so session and plan are never
//! touched concurrently.  Radio write failures are logged and the session
//! carries on; connection failures become events.

use std::iter;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::bus::Outbox;
use crate::calibration::{
    debug_schedule, pairwise_schedule, triplet_schedule, CalibrationPlan, PlanKind, Round,
    RoundSettings,
};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::messages::{
    CalibrationFinished, CalibrationMeasurement, Command, DeviceFailure, DeviceStatus, Event,
    Measurement, RangingNotification, SimpleCalibrationMeasurement, StartCalibration,
    StartDebugCalibration, StartDistanceMeasurement, StartTestMeasurement, TestFinished,
    TestMeasurement,
};
use crate::protocol::{
    antenna_delay_or_default, encode_frame, responder_index, DeviceRole, MeasurementMessage,
    SetupMessage, CONTROL_CHARACTERISTIC, SETUP_CHARACTERISTIC,
};
use crate::radio::Radio;
use crate::registry::{notify_key, DeviceRegistry};
use crate::types::{MeasurementType, RangingFrame, StandardFrame, TripletFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Idle,
    Distance,
    Test { test_id: u64 },
    Calibration { calibration_id: u64 },
    TripletCalibration { calibration_id: u64 },
}

/// The active (or last reset) measurement session.
///
/// For triplet rounds `initiator` is position A and `responders` are B and C.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSession {
    pub mode: SessionMode,
    pub initiator: String,
    pub responders: Vec<String>,
    pub measurement_type: MeasurementType,
    /// Measurement count that completes the session; `None` runs until stopped.
    pub max_count: Option<u32>,
    pub running: bool,
}

impl MeasurementSession {
    fn idle() -> Self {
        Self {
            mode: SessionMode::Idle,
            initiator: String::new(),
            responders: Vec::new(),
            measurement_type: MeasurementType::default(),
            max_count: None,
            running: false,
        }
    }

    /// Responders first, initiator last: responders must be listening before
    /// the initiator starts polling.
    pub fn participants(&self) -> Vec<String> {
        self.responders
            .iter()
            .cloned()
            .chain(iter::once(self.initiator.clone()))
            .collect()
    }

    pub fn is_participant(&self, device_id: &str) -> bool {
        self.initiator == device_id || self.responders.iter().any(|r| r == device_id)
    }

    /// Name of the responder a standard frame refers to.
    ///
    /// Single-responder sessions use that responder directly; otherwise the
    /// firmware id is mapped through [`responder_index`].
    pub fn resolve_responder(&self, responder_id: u16) -> Option<&str> {
        match self.responders.as_slice() {
            [only] => Some(only),
            all => all.get(responder_index(responder_id)).map(String::as_str),
        }
    }
}

/// A zero threshold means "run until stopped".
fn threshold(max_count: u32) -> Option<u32> {
    (max_count > 0).then_some(max_count)
}

type Setups = Vec<(String, SetupMessage)>;

/// Setup frames for an initiator / responders session.
fn pair_setups(
    initiator: &str,
    responders: &[String],
    measurement_type: MeasurementType,
    bounds: (u32, u32),
    initiator_delays: (u32, u32),
    responder_delays: (u32, u32),
) -> Setups {
    let frame = |role, (rx, tx)| {
        SetupMessage::new(role, initiator, responders, measurement_type)
            .with_bounds(bounds.0, bounds.1)
            .with_antenna_delays(rx, tx)
    };
    iter::once((initiator.to_owned(), frame(DeviceRole::Initiator, initiator_delays)))
        .chain(
            responders
                .iter()
                .map(|r| (r.clone(), frame(DeviceRole::Responder, responder_delays))),
        )
        .collect()
}

/// Setup frames for a triplet round in positions A, B, C.
fn triplet_setups(devices: &[String; 3], settings: &RoundSettings) -> Setups {
    let responders = [devices[1].clone(), devices[2].clone()];
    [DeviceRole::A, DeviceRole::B, DeviceRole::C]
        .into_iter()
        .zip(devices.iter())
        .map(|(role, device)| {
            let frame = SetupMessage::new(role, &devices[0], &responders, settings.measurement_type)
                .with_bounds(0, settings.max_count)
                .with_antenna_delays(settings.rx_ticks, settings.tx_ticks);
            (device.clone(), frame)
        })
        .collect()
}

fn measurement(session: &MeasurementSession, responder: &str, f: &StandardFrame) -> Measurement {
    Measurement {
        initiator: session.initiator.clone(),
        responder: responder.to_owned(),
        measurement_type: session.measurement_type,
        sequence: f.sequence,
        measurement: f.measurement,
        distance: f.distance,
        time_round_1: f.time_round_1,
        time_round_2: f.time_round_2,
        time_reply_1: f.time_reply_1,
        time_reply_2: f.time_reply_2,
        nlos: f.nlos,
        rssi: f.rssi,
        fpi: f.fpi,
    }
}

pub struct MeasurementOrchestrator<R: Radio> {
    registry: DeviceRegistry<R>,
    session: MeasurementSession,
    plan: Option<CalibrationPlan>,
    /// Bumped on every session start; listeners stamp their frames with it.
    generation: u64,
    session_settle: Duration,
}

impl<R: Radio> MeasurementOrchestrator<R> {
    pub fn new(registry: DeviceRegistry<R>, config: &GatewayConfig) -> Self {
        Self {
            registry,
            session: MeasurementSession::idle(),
            plan: None,
            generation: 0,
            session_settle: config.session_settle,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry<R> {
        &self.registry
    }

    pub fn session(&self) -> &MeasurementSession {
        &self.session
    }

    pub fn plan(&self) -> Option<&CalibrationPlan> {
        self.plan.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A session is running or a calibration plan is between rounds.
    pub fn is_busy(&self) -> bool {
        self.session.running || self.plan.is_some()
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    pub async fn connect_device(&mut self, device_id: &str, outbox: &mut Outbox) {
        let device_id = device_id.to_owned();
        match self.registry.connect(&device_id).await {
            Ok(_) => outbox.emit(Event::DeviceConnected(DeviceStatus { device_id })),
            Err(GatewayError::DeviceNotFound(_)) => {
                warn!("{device_id}: not found");
                outbox.emit(Event::ConnectFailed(DeviceFailure {
                    device_id,
                    reason: Some("Not Found".into()),
                }));
            }
            Err(e) => {
                warn!("{e}");
                outbox.emit(Event::ConnectError(DeviceFailure {
                    device_id,
                    reason: Some(e.to_string()),
                }));
            }
        }
    }

    /// Disconnect `device_id`.  A session it takes part in is stopped and a
    /// calibration plan using it is abandoned.
    pub async fn disconnect_device(&mut self, device_id: &str, outbox: &mut Outbox) {
        if self.session.running && self.session.is_participant(device_id) {
            warn!("{device_id}: leaving an active session, stopping it");
            self.stop().await;
        }
        if !self.registry.disconnect(device_id).await {
            debug!("{device_id}: was not connected");
        }
        outbox.emit(Event::DeviceDisconnected(DeviceStatus {
            device_id: device_id.to_owned(),
        }));
    }

    // ── Session starts ───────────────────────────────────────────────────────

    pub async fn start_distance(&mut self, cmd: StartDistanceMeasurement) {
        if self.reject_if_busy("distance measurement")
            || reject_if_empty("distance measurement", &cmd.responders)
        {
            return;
        }
        let delays = (
            antenna_delay_or_default(cmd.rx_delay),
            antenna_delay_or_default(cmd.tx_delay),
        );
        let setups = pair_setups(
            &cmd.initiator,
            &cmd.responders,
            cmd.measurement_type,
            (0, 0),
            delays,
            delays,
        );
        let session = MeasurementSession {
            mode: SessionMode::Distance,
            initiator: cmd.initiator,
            responders: cmd.responders,
            measurement_type: cmd.measurement_type,
            max_count: None,
            running: false,
        };
        self.begin_session(setups, session).await;
    }

    pub async fn start_test(&mut self, cmd: StartTestMeasurement) {
        if self.reject_if_busy("test measurement")
            || reject_if_empty("test measurement", &cmd.responders)
        {
            return;
        }
        let setups = pair_setups(
            &cmd.initiator,
            &cmd.responders,
            cmd.measurement_type,
            (cmd.min_count, cmd.max_count),
            (
                antenna_delay_or_default(cmd.initiator_rx_delay),
                antenna_delay_or_default(cmd.initiator_tx_delay),
            ),
            (
                antenna_delay_or_default(cmd.responder_rx_delay),
                antenna_delay_or_default(cmd.responder_tx_delay),
            ),
        );
        let session = MeasurementSession {
            mode: SessionMode::Test { test_id: cmd.test_id },
            initiator: cmd.initiator,
            responders: cmd.responders,
            measurement_type: cmd.measurement_type,
            max_count: threshold(cmd.max_count),
            running: false,
        };
        self.begin_session(setups, session).await;
    }

    /// Build a pairwise or triplet plan and post the first round.
    pub async fn start_calibration(&mut self, cmd: StartCalibration, kind: PlanKind, outbox: &mut Outbox) {
        if self.reject_if_busy("calibration") {
            return;
        }
        let rounds = match kind {
            PlanKind::Pairwise => pairwise_schedule(&cmd.devices),
            PlanKind::Triplet => triplet_schedule(&cmd.devices),
        };
        let settings = RoundSettings {
            max_count: cmd.max_count,
            measurement_type: cmd.measurement_type,
            rx_ticks: antenna_delay_or_default(cmd.rx_delay),
            tx_ticks: antenna_delay_or_default(cmd.tx_delay),
        };
        self.install_plan(CalibrationPlan::new(cmd.calibration_id, kind, settings, rounds), outbox);
    }

    pub async fn start_debug_calibration(&mut self, cmd: StartDebugCalibration, outbox: &mut Outbox) {
        if self.reject_if_busy("debug calibration") {
            return;
        }
        let settings = RoundSettings {
            max_count: cmd.max_count,
            measurement_type: cmd.measurement_type,
            rx_ticks: antenna_delay_or_default(cmd.rx_delay),
            tx_ticks: antenna_delay_or_default(cmd.tx_delay),
        };
        let rounds = debug_schedule(&cmd.initiator, &cmd.responders);
        let plan = CalibrationPlan::new(cmd.calibration_id, PlanKind::Pairwise, settings, rounds);
        self.install_plan(plan, outbox);
    }

    fn install_plan(&mut self, plan: CalibrationPlan, outbox: &mut Outbox) {
        info!(
            "calibration {}: {:?} plan with {} round(s)",
            plan.calibration_id,
            plan.kind,
            plan.total()
        );
        self.plan = Some(plan);
        outbox.post(Command::AdvanceCalibrationRound);
    }

    /// Run the next round of the active plan, or finish it.
    pub async fn advance_calibration_round(&mut self, outbox: &mut Outbox) {
        let Some(plan) = self.plan.as_mut() else {
            warn!("calibration: advance requested without a plan");
            return;
        };
        let (calibration_id, kind, settings) = (plan.calibration_id, plan.kind, plan.settings);

        let Some(round) = plan.next_round() else {
            info!("calibration {calibration_id}: all {} round(s) done", plan.total());
            self.plan = None;
            self.session.running = false;
            let finished = CalibrationFinished { calibration_id };
            outbox.emit(match kind {
                PlanKind::Pairwise => Event::CalibrationFinished(finished),
                PlanKind::Triplet => Event::SimpleCalibrationFinished(finished),
            });
            return;
        };
        info!(
            "calibration {calibration_id}: round {}/{}: {:?}",
            plan.completed().len(),
            plan.total(),
            round.devices()
        );

        let max_count = threshold(settings.max_count);
        let (setups, session) = match round {
            Round::Pair { initiator, responder } => {
                let responders = vec![responder];
                let delays = (settings.rx_ticks, settings.tx_ticks);
                let setups = pair_setups(
                    &initiator,
                    &responders,
                    settings.measurement_type,
                    (0, settings.max_count),
                    delays,
                    delays,
                );
                let session = MeasurementSession {
                    mode: SessionMode::Calibration { calibration_id },
                    initiator,
                    responders,
                    measurement_type: settings.measurement_type,
                    max_count,
                    running: false,
                };
                (setups, session)
            }
            Round::Triplet(devices) => {
                let setups = triplet_setups(&devices, &settings);
                let [a, b, c] = devices;
                let session = MeasurementSession {
                    mode: SessionMode::TripletCalibration { calibration_id },
                    initiator: a,
                    responders: vec![b, c],
                    measurement_type: settings.measurement_type,
                    max_count,
                    running: false,
                };
                (setups, session)
            }
        };
        self.begin_session(setups, session).await;
    }

    // ── Session stop ─────────────────────────────────────────────────────────

    /// Stop the running session and abandon any calibration plan.
    pub async fn stop(&mut self) {
        if let Some(plan) = self.plan.take() {
            info!(
                "calibration {}: abandoned with {} of {} round(s) left",
                plan.calibration_id,
                plan.remaining(),
                plan.total()
            );
        }
        self.stop_session().await;
    }

    /// Stop the session and release every device and task.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.registry.cleanup_all().await;
    }

    // ── Notifications ────────────────────────────────────────────────────────

    /// Turn one decoded frame into exactly one event, and complete the session
    /// when the frame carries the threshold count.
    pub async fn on_ranging_frame(&mut self, note: RangingNotification, outbox: &mut Outbox) {
        if !self.session.running {
            debug!("{}: frame outside a session dropped", note.device_id);
            return;
        }
        if note.session != self.generation || !self.session.is_participant(&note.device_id) {
            debug!(
                "{}: stale frame from session {} dropped (current {})",
                note.device_id, note.session, self.generation
            );
            return;
        }
        let count = note.frame.measurement();

        let event = match (self.session.mode, &note.frame) {
            (SessionMode::TripletCalibration { calibration_id }, RangingFrame::Triplet(f)) => {
                self.triplet_event(calibration_id, f)
            }
            (mode, RangingFrame::Standard(f)) if mode_takes_standard(mode) => {
                let Some(responder) = self.session.resolve_responder(f.responder_id) else {
                    warn!(
                        "{}: responder id {} outside responder list {:?}",
                        note.device_id, f.responder_id, self.session.responders
                    );
                    return;
                };
                let m = measurement(&self.session, responder, f);
                match mode {
                    SessionMode::Test { test_id } => {
                        Event::TestMeasurement(TestMeasurement { test_id, measurement: m })
                    }
                    SessionMode::Calibration { calibration_id } => {
                        Event::CalibrationMeasurement(CalibrationMeasurement {
                            calibration_id,
                            measurement: m,
                        })
                    }
                    _ => Event::DistanceMeasurement(m),
                }
            }
            (mode, frame) => {
                warn!(
                    "{}: {} frame does not fit a {mode:?} session, dropped",
                    note.device_id,
                    match frame {
                        RangingFrame::Standard(_) => "standard",
                        RangingFrame::Triplet(_) => "triplet",
                    }
                );
                return;
            }
        };
        debug!("{}: seq {} count {count}", note.device_id, note.frame.sequence());
        outbox.emit(event);

        if self.session.max_count == Some(count) {
            self.complete_session(outbox).await;
        }
    }

    fn triplet_event(&self, calibration_id: u64, f: &TripletFrame) -> Event {
        let s = &self.session;
        let at = |i: usize| s.responders.get(i).cloned().unwrap_or_default();
        Event::SimpleCalibrationMeasurement(SimpleCalibrationMeasurement {
            calibration_id,
            sequence: f.sequence,
            measurement: f.measurement,
            devices: [s.initiator.clone(), at(0), at(1)],
            timestamps: f.timestamps,
            time_round_1: f.time_round_1,
            time_round_2: f.time_round_2,
            time_reply_1: f.time_reply_1,
            time_reply_2: f.time_reply_2,
            distance: f.distance,
        })
    }

    async fn complete_session(&mut self, outbox: &mut Outbox) {
        let mode = self.session.mode;
        info!("{mode:?}: threshold reached");
        self.stop_session().await;
        match mode {
            SessionMode::Test { test_id } => outbox.emit(Event::TestFinished(TestFinished { test_id })),
            SessionMode::Calibration { .. } | SessionMode::TripletCalibration { .. } => {
                outbox.post(Command::AdvanceCalibrationRound)
            }
            SessionMode::Idle | SessionMode::Distance => {}
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn reject_if_busy(&self, what: &str) -> bool {
        if self.is_busy() {
            warn!("{what} rejected: a session is already active ({:?})", self.session.mode);
            return true;
        }
        false
    }

    /// Push setups, wait the settle delay, send `start`, attach listeners.
    async fn begin_session(&mut self, setups: Setups, mut session: MeasurementSession) {
        self.generation += 1;
        for (device, setup) in &setups {
            self.write_frame(device, SETUP_CHARACTERISTIC, setup).await;
        }
        tokio::time::sleep(self.session_settle).await;

        let participants = session.participants();
        let start = MeasurementMessage::start();
        for device in &participants {
            self.write_frame(device, CONTROL_CHARACTERISTIC, &start).await;
        }
        for device in &participants {
            if let Err(e) = self.registry.start_notify(device, self.generation).await {
                warn!("{device}: no listener: {e}");
            }
        }
        session.running = true;
        info!(
            "{:?} started: {} → {:?} ({})",
            session.mode,
            session.initiator,
            session.responders,
            session.measurement_type.as_str()
        );
        self.session = session;
    }

    async fn stop_session(&mut self) {
        if self.session.mode == SessionMode::Idle {
            return;
        }
        let participants = self.session.participants();
        let stop = MeasurementMessage::stop();
        for device in &participants {
            self.write_frame(device, CONTROL_CHARACTERISTIC, &stop).await;
        }
        for device in &participants {
            self.registry.cancel(&notify_key(device));
        }
        info!("{:?} stopped", self.session.mode);
        self.session = MeasurementSession::idle();
    }

    /// Best-effort write: failures are logged, never propagated.
    async fn write_frame<T: Serialize + Sync>(&self, device: &str, characteristic: Uuid, frame: &T) {
        let bytes = match encode_frame(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("{device}: cannot encode control frame: {e}");
                return;
            }
        };
        if let Err(e) = self.registry.send_control(device, characteristic, &bytes).await {
            warn!("{e}");
        }
    }
}

fn reject_if_empty(what: &str, responders: &[String]) -> bool {
    if responders.is_empty() {
        warn!("{what} rejected: no responders given");
        return true;
    }
    false
}

fn mode_takes_standard(mode: SessionMode) -> bool {
    matches!(
        mode,
        SessionMode::Distance | SessionMode::Test { .. } | SessionMode::Calibration { .. }
    )
}
