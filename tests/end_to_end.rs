//! Backend command → BLE traffic → decoded frame → backend record, driven
//! through the public API with an in-memory radio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::channel::mpsc as chan;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use uwb_gateway::envelope;
use uwb_gateway::parse;
use uwb_gateway::prelude::*;
use uwb_gateway::protocol::{CONTROL_CHARACTERISTIC, SETUP_CHARACTERISTIC};
use uwb_gateway::radio::{NotificationStream, ScanResult};
use uwb_gateway::registry::{keepalive_key, notify_key};

#[derive(Default)]
struct BenchRadio {
    advertised: Vec<String>,
    connected: Mutex<HashSet<String>>,
    writes: Mutex<Vec<(String, Uuid, Value)>>,
    notifiers: Mutex<HashMap<String, chan::UnboundedSender<Vec<u8>>>>,
}

impl BenchRadio {
    fn writes(&self, device: &str, characteristic: Uuid) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, c, _)| d == device && *c == characteristic)
            .map(|(_, _, v)| v.clone())
            .collect()
    }

    fn notify(&self, device: &str, bytes: Vec<u8>) {
        self.notifiers.lock().unwrap()[device].unbounded_send(bytes).unwrap();
    }
}

#[async_trait]
impl Radio for BenchRadio {
    type Peripheral = String;

    async fn scan(&self, _timeout: Duration) -> anyhow::Result<Vec<ScanResult<String>>> {
        Ok(self
            .advertised
            .iter()
            .map(|n| ScanResult {
                name: n.clone(),
                address: format!("bench:{n}"),
                peripheral: n.clone(),
            })
            .collect())
    }

    async fn connect(&self, p: &String) -> anyhow::Result<()> {
        self.connected.lock().unwrap().insert(p.clone());
        Ok(())
    }

    async fn is_connected(&self, p: &String) -> bool {
        self.connected.lock().unwrap().contains(p)
    }

    async fn write_characteristic(&self, p: &String, c: Uuid, bytes: &[u8]) -> anyhow::Result<()> {
        let value = serde_json::from_slice(bytes).map_err(|e| anyhow!("not JSON: {e}"))?;
        self.writes.lock().unwrap().push((p.clone(), c, value));
        Ok(())
    }

    async fn subscribe_notify(&self, p: &String, _c: Uuid) -> anyhow::Result<NotificationStream> {
        let (tx, rx) = chan::unbounded();
        self.notifiers.lock().unwrap().insert(p.clone(), tx);
        Ok(rx.boxed())
    }

    async fn disconnect(&self, p: &String) -> anyhow::Result<()> {
        self.connected.lock().unwrap().remove(p);
        Ok(())
    }
}

struct Bench {
    radio: Arc<BenchRadio>,
    bus: GatewayBus<BenchRadio>,
    inbox_rx: mpsc::UnboundedReceiver<Message>,
    outbound_rx: mpsc::UnboundedReceiver<Value>,
}

impl Bench {
    fn new(devices: &[&str]) -> Self {
        let radio = Arc::new(BenchRadio {
            advertised: devices.iter().map(|d| format!("tag-{d}")).collect(),
            ..BenchRadio::default()
        });
        let config = GatewayConfig::default();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(Arc::clone(&radio), inbox, &config);
        let bus = build_bus(GatewayDeps {
            orchestrator: MeasurementOrchestrator::new(registry, &config),
            outbound,
            client_id: config.client_id.clone(),
        });
        Self { radio, bus, inbox_rx, outbound_rx }
    }

    /// Feed one backend envelope through the same decoder the bridge uses.
    async fn backend_sends(&mut self, envelope: Value) {
        let message = envelope::decode(&envelope.to_string()).unwrap();
        self.bus.handle(message).await.unwrap();
    }

    /// Dispatch the next message a listener or keepalive task posted.
    async fn pump(&mut self) {
        let message = self.inbox_rx.recv().await.unwrap();
        self.bus.handle(message).await.unwrap();
    }

    fn backend_received(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.outbound_rx.try_recv().ok()).collect()
    }

    fn orchestrator(&self) -> &MeasurementOrchestrator<BenchRadio> {
        &self.bus.deps().orchestrator
    }
}

fn ranging_frame(responder_id: u16, sequence: u32, distance: f32) -> Vec<u8> {
    parse::encode(&RangingFrame::Standard(StandardFrame {
        msg_type: "sstwr".into(),
        state: "result".into(),
        responder_id,
        sequence,
        measurement: sequence,
        distance,
        time_round_1: 10.0,
        time_round_2: 20.0,
        time_reply_1: 5.0,
        time_reply_2: 6.0,
        nlos: 0,
        rssi: -79.0,
        fpi: -81.5,
    }))
}

#[tokio::test(start_paused = true)]
async fn distance_measurement_round_trip() {
    let mut bench = Bench::new(&["A", "B", "C"]);

    for id in ["A", "B", "C"] {
        bench
            .backend_sends(json!({"type": "ConnectBleDevice", "data": {"device_id": id}}))
            .await;
    }
    let registered: Vec<_> = bench
        .backend_received()
        .into_iter()
        .map(|v| (v["type"].clone(), v["data"]["device_id"].clone()))
        .collect();
    assert_eq!(
        registered,
        [
            (json!("RegisterBleConnection"), json!("A")),
            (json!("RegisterBleConnection"), json!("B")),
            (json!("RegisterBleConnection"), json!("C")),
        ]
    );

    bench
        .backend_sends(json!({
            "type": "StartDistanceMeasurement",
            "data": {"initiator": "A", "responder": ["B", "C"], "measurement_type": "ss_twr"}
        }))
        .await;

    let radio = Arc::clone(&bench.radio);
    for (device, role) in [("A", "initiator"), ("B", "responder"), ("C", "responder")] {
        let setup = radio.writes(&format!("tag-{device}"), SETUP_CHARACTERISTIC);
        assert_eq!(setup.len(), 1, "{device}");
        assert_eq!(setup[0]["device_type"], role);
        assert_eq!(setup[0]["initiator_device"], "A");
        assert_eq!(setup[0]["responder_device"], json!(["B", "C"]));
        assert_eq!(setup[0]["measurement_type"], "ss_twr");
        assert!(bench.orchestrator().registry().is_task_running(&notify_key(device)));
    }
    assert!(bench.orchestrator().session().running);

    radio.notify("tag-A", ranging_frame(100, 1, 2.53));
    bench.pump().await;

    let records = bench.backend_received();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["type"], "SaveMesurement");
    assert_eq!(record["data"]["initiator"], "A");
    assert_eq!(record["data"]["responder"], "B");
    assert_eq!(record["data"]["sequence"], 1);
    assert!((record["data"]["distance"].as_f64().unwrap() - 2.53).abs() < 1e-6);

    bench
        .backend_sends(json!({"type": "StopDistanceMeasurement", "data": {}}))
        .await;

    for device in ["A", "B", "C"] {
        let control = radio.writes(&format!("tag-{device}"), CONTROL_CHARACTERISTIC);
        assert_eq!(control.last().unwrap()["command"], "stop");
        assert!(!bench.orchestrator().registry().is_task_running(&notify_key(device)));
        assert!(bench.orchestrator().registry().is_task_running(&keepalive_key(device)));
    }
    assert!(!bench.orchestrator().session().running);
}

#[tokio::test(start_paused = true)]
async fn test_run_reports_finish_to_backend() {
    let mut bench = Bench::new(&["A", "B"]);
    for id in ["A", "B"] {
        bench
            .backend_sends(json!({"type": "ConnectBleDevice", "data": {"device_id": id}}))
            .await;
    }
    bench.backend_received();

    bench
        .backend_sends(json!({
            "type": "StartTestMeasurement",
            "data": {
                "test_id": 17, "initiator": "A", "responder": ["B"],
                "min_measurement": 1, "max_measurement": 2, "measurement_type": "ds_twr"
            }
        }))
        .await;

    let radio = Arc::clone(&bench.radio);
    radio.notify("tag-A", ranging_frame(100, 1, 1.0));
    radio.notify("tag-A", ranging_frame(100, 2, 1.1));
    bench.pump().await;
    bench.pump().await;

    let types: Vec<_> = bench
        .backend_received()
        .into_iter()
        .map(|v| v["type"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(types, ["SaveTestMeasurement", "SaveTestMeasurement", "TestMeasurementFinished"]);
    assert!(!bench.orchestrator().is_busy());
}

#[tokio::test(start_paused = true)]
async fn lost_link_unregisters_the_device() {
    let mut bench = Bench::new(&["A"]);
    bench
        .backend_sends(json!({"type": "ConnectBleDevice", "data": {"device_id": "A"}}))
        .await;
    bench.backend_received();

    bench.radio.connected.lock().unwrap().clear();
    bench.pump().await;

    assert_eq!(
        bench.backend_received(),
        [json!({"type": "UnregisterBleConnection", "data": {"device_id": "A"}})]
    );
    assert!(!bench.orchestrator().registry().is_connected("A"));
}
