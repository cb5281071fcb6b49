//! Bus wiring: which handler serves which command, and how events reach the
//! backend.
//!
//! | Command | Handler |
//! |---|---|
//! | `RegisterClient` | send registration envelope |
//! | `Ping` | answer with a registration envelope |
//! | `ConnectDevice` / `DisconnectDevice` | [`MeasurementOrchestrator::connect_device`] / [`MeasurementOrchestrator::disconnect_device`] |
//! | `StartDistanceMeasurement` / `StartTestMeasurement` | session start |
//! | `StopDistanceMeasurement` | [`MeasurementOrchestrator::stop`] |
//! | `StartCalibration` / `StartSimpleCalibration` / `StartDebugCalibration` | plan build |
//! | `AdvanceCalibrationRound` | next round |
//! | `RangingNotification` | [`MeasurementOrchestrator::on_ranging_frame`] |
//!
//! Every event kind is forwarded to the backend through [`envelope::backend`].

use futures::future::BoxFuture;
use log::warn;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::{MessageBus, Outbox};
use crate::calibration::PlanKind;
use crate::envelope;
use crate::error::{GatewayError, Result};
use crate::messages::{Command, CommandKind, Event, EventKind};
use crate::orchestrator::MeasurementOrchestrator;
use crate::radio::Radio;

/// Envelopes waiting to be written to the backend socket.
pub type Outbound = mpsc::UnboundedSender<Value>;

/// Everything bus handlers act on.
pub struct GatewayDeps<R: Radio> {
    pub orchestrator: MeasurementOrchestrator<R>,
    pub outbound: Outbound,
    pub client_id: String,
}

impl<R: Radio> GatewayDeps<R> {
    fn send(&self, envelope: Value) {
        if self.outbound.send(envelope).is_err() {
            warn!("backend: outbound queue closed, envelope dropped");
        }
    }
}

pub type GatewayBus<R> = MessageBus<GatewayDeps<R>>;

/// Build the bus with every handler registered.
pub fn build_bus<R: Radio>(deps: GatewayDeps<R>) -> GatewayBus<R> {
    let bus = MessageBus::new(deps)
        .on_command(CommandKind::RegisterClient, register_client)
        .on_command(CommandKind::Ping, ping)
        .on_command(CommandKind::ConnectDevice, connect_device)
        .on_command(CommandKind::DisconnectDevice, disconnect_device)
        .on_command(CommandKind::StartDistanceMeasurement, start_distance)
        .on_command(CommandKind::StopDistanceMeasurement, stop_measurement)
        .on_command(CommandKind::StartTestMeasurement, start_test)
        .on_command(CommandKind::StartCalibration, start_calibration)
        .on_command(CommandKind::StartSimpleCalibration, start_calibration)
        .on_command(CommandKind::StartDebugCalibration, start_debug_calibration)
        .on_command(CommandKind::AdvanceCalibrationRound, advance_calibration_round)
        .on_command(CommandKind::RangingNotification, ranging_notification);
    EventKind::ALL
        .into_iter()
        .fold(bus, |bus, kind| bus.on_event(kind, forward_to_backend))
}

fn misrouted(kind: CommandKind) -> GatewayError {
    GatewayError::UnroutableMessage(format!("{kind:?} reached the wrong handler"))
}

// ── Command handlers ──────────────────────────────────────────────────────────

fn register_client<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    _: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::RegisterClient(req) = cmd else { return Err(misrouted(kind)) };
        deps.send(envelope::registration(&req.client_id));
        Ok(())
    })
}

fn ping<'a, R: Radio>(deps: &'a mut GatewayDeps<R>, _: Command, _: &'a mut Outbox) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        deps.send(envelope::registration(&deps.client_id));
        Ok(())
    })
}

fn connect_device<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::ConnectDevice(req) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.connect_device(&req.device_id, out).await;
        Ok(())
    })
}

fn disconnect_device<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::DisconnectDevice(req) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.disconnect_device(&req.device_id, out).await;
        Ok(())
    })
}

fn start_distance<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    _: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::StartDistanceMeasurement(req) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.start_distance(req).await;
        Ok(())
    })
}

fn stop_measurement<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    _: Command,
    _: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        deps.orchestrator.stop().await;
        Ok(())
    })
}

fn start_test<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    _: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::StartTestMeasurement(req) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.start_test(req).await;
        Ok(())
    })
}

/// Serves both pairwise and triplet calibration requests.
fn start_calibration<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let (req, plan) = match cmd {
            Command::StartCalibration(req) => (req, PlanKind::Pairwise),
            Command::StartSimpleCalibration(req) => (req, PlanKind::Triplet),
            other => return Err(misrouted(other.kind())),
        };
        deps.orchestrator.start_calibration(req, plan, out).await;
        Ok(())
    })
}

fn start_debug_calibration<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::StartDebugCalibration(req) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.start_debug_calibration(req, out).await;
        Ok(())
    })
}

fn advance_calibration_round<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    _: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        deps.orchestrator.advance_calibration_round(out).await;
        Ok(())
    })
}

fn ranging_notification<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    cmd: Command,
    out: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let kind = cmd.kind();
        let Command::RangingNotification(note) = cmd else { return Err(misrouted(kind)) };
        deps.orchestrator.on_ranging_frame(note, out).await;
        Ok(())
    })
}

// ── Event handlers ────────────────────────────────────────────────────────────

fn forward_to_backend<'a, R: Radio>(
    deps: &'a mut GatewayDeps<R>,
    event: &'a Event,
    _: &'a mut Outbox,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        deps.send(envelope::backend(event));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::messages::{DeviceRequest, Message};
    use crate::radio::fake::FakeRadio;
    use crate::registry::DeviceRegistry;

    fn gateway(names: &[&str]) -> (GatewayBus<FakeRadio>, mpsc::UnboundedReceiver<Value>) {
        let radio = Arc::new(FakeRadio::advertising(names));
        let config = GatewayConfig::default();
        let (inbox, _) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(radio, inbox, &config);
        let deps = GatewayDeps {
            orchestrator: MeasurementOrchestrator::new(registry, &config),
            outbound,
            client_id: config.client_id.clone(),
        };
        (build_bus(deps), outbound_rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn ping_answers_with_registration() {
        let (mut bus, mut rx) = gateway(&[]);
        bus.handle(Command::Ping.into()).await.unwrap();
        assert_eq!(
            sent(&mut rx),
            [json!({"type": "RegisterWsClient", "data": {"client_id": "PI_Home"}})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_outcomes_reach_the_backend() {
        let (mut bus, mut rx) = gateway(&["T1"]);
        for id in ["T1", "T9"] {
            let cmd = Command::ConnectDevice(DeviceRequest { device_id: id.into() });
            bus.handle(Message::from(cmd)).await.unwrap();
        }
        let types: Vec<_> = sent(&mut rx).into_iter().map(|v| v["type"].clone()).collect();
        assert_eq!(types, [json!("RegisterBleConnection"), json!("BleDeviceConnectFailed")]);
        assert!(bus.deps().orchestrator.registry().is_connected("T1"));
    }

    #[tokio::test]
    async fn device_free_commands_are_routed() {
        let (mut bus, _rx) = gateway(&[]);
        // Commands that need no connected device must not come back unroutable.
        for cmd in [Command::Ping, Command::StopDistanceMeasurement, Command::AdvanceCalibrationRound] {
            bus.handle(cmd.into()).await.unwrap();
        }
    }
}
