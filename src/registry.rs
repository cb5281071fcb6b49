//! Connected peripherals and the background tasks that belong to them.
//!
//! Background work is addressed by a logical key (`notify:<id>`,
//! `keepalive:<id>`) instead of a task handle, so orchestration code can
//! cancel a device's listener by role.  Cancelling an unknown key is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::Inbox;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::messages::{Command, DeviceRequest, RangingNotification};
use crate::parse;
use crate::protocol::NOTIFY_CHARACTERISTIC;
use crate::radio::Radio;

pub fn notify_key(device_id: &str) -> String {
    format!("notify:{device_id}")
}

pub fn keepalive_key(device_id: &str) -> String {
    format!("keepalive:{device_id}")
}

/// A connected peripheral.
#[derive(Debug, Clone)]
pub struct DeviceHandle<P> {
    /// Logical id the backend uses for this device.
    pub device_id: String,
    /// Advertised name; contains `device_id`.
    pub name: String,
    pub address: String,
    pub peripheral: P,
}

struct TaskSlot {
    token: CancellationToken,
    join: JoinHandle<()>,
}

pub struct DeviceRegistry<R: Radio> {
    radio: Arc<R>,
    inbox: Inbox,
    scan_timeout: Duration,
    connect_settle: Duration,
    keepalive_interval: Duration,
    devices: HashMap<String, DeviceHandle<R::Peripheral>>,
    tasks: HashMap<String, TaskSlot>,
}

impl<R: Radio> DeviceRegistry<R> {
    pub fn new(radio: Arc<R>, inbox: Inbox, config: &GatewayConfig) -> Self {
        Self {
            radio,
            inbox,
            scan_timeout: config.scan_timeout,
            connect_settle: config.connect_settle,
            keepalive_interval: config.keepalive_interval,
            devices: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Scan for a peripheral whose name contains `device_id`, connect, wait
    /// for the settle window and confirm the link is still up.
    ///
    /// A device that is already connected is returned as is.
    ///
    /// # Errors
    /// [`GatewayError::DeviceNotFound`] on a scan miss,
    /// [`GatewayError::DeviceConnect`] when the link fails or drops while
    /// settling.
    pub async fn connect(&mut self, device_id: &str) -> Result<&DeviceHandle<R::Peripheral>> {
        if self.devices.contains_key(device_id) {
            info!("{device_id}: already connected");
            return self.handle(device_id).ok_or_else(|| GatewayError::UnknownDevice(device_id.into()));
        }

        let connect_error = |reason: String| GatewayError::DeviceConnect {
            device_id: device_id.to_owned(),
            reason,
        };

        let found = self
            .radio
            .scan(self.scan_timeout)
            .await
            .map_err(|e| connect_error(format!("scan failed: {e}")))?
            .into_iter()
            .find(|d| d.name.contains(device_id))
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_owned()))?;
        info!("{device_id}: found {} at {}", found.name, found.address);

        self.radio
            .connect(&found.peripheral)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        tokio::time::sleep(self.connect_settle).await;

        if !self.radio.is_connected(&found.peripheral).await {
            self.radio.disconnect(&found.peripheral).await.ok();
            return Err(connect_error("link dropped while settling".into()));
        }
        info!("{device_id}: connected");

        self.spawn_keepalive(device_id, found.peripheral.clone());
        self.devices.insert(
            device_id.to_owned(),
            DeviceHandle {
                device_id: device_id.to_owned(),
                name: found.name,
                address: found.address,
                peripheral: found.peripheral,
            },
        );
        self.handle(device_id).ok_or_else(|| GatewayError::UnknownDevice(device_id.into()))
    }

    /// Drop the handle for `device_id`, cancel its tasks and close the link.
    /// Returns `false` if the device was not connected.
    pub async fn disconnect(&mut self, device_id: &str) -> bool {
        self.cancel(&notify_key(device_id));
        self.cancel(&keepalive_key(device_id));
        let Some(handle) = self.devices.remove(device_id) else {
            return false;
        };
        if let Err(e) = self.radio.disconnect(&handle.peripheral).await {
            warn!("{device_id}: disconnect failed: {e}");
        }
        info!("{device_id}: disconnected");
        true
    }

    pub fn handle(&self, device_id: &str) -> Option<&DeviceHandle<R::Peripheral>> {
        self.devices.get(device_id)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Ids of every connected device.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    // ── GATT traffic ─────────────────────────────────────────────────────────

    /// Write `bytes` to `characteristic` on `device_id`.
    pub async fn send_control(&self, device_id: &str, characteristic: Uuid, bytes: &[u8]) -> Result<()> {
        let handle = self
            .devices
            .get(device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_owned()))?;
        self.radio
            .write_characteristic(&handle.peripheral, characteristic, bytes)
            .await
            .map_err(|e| GatewayError::RadioWrite {
                device_id: device_id.to_owned(),
                reason: e.to_string(),
            })?;
        debug!("{device_id}: wrote {} B to {characteristic}", bytes.len());
        Ok(())
    }

    /// Subscribe to ranging notifications from `device_id` and run a listener
    /// under [`notify_key`].  Each payload is decoded here; good frames are
    /// posted to the bus inbox stamped with `session`, undecodable ones are
    /// logged and dropped.
    pub async fn start_notify(&mut self, device_id: &str, session: u64) -> Result<()> {
        let peripheral = self
            .devices
            .get(device_id)
            .map(|h| h.peripheral.clone())
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_owned()))?;
        let mut stream = self
            .radio
            .subscribe_notify(&peripheral, NOTIFY_CHARACTERISTIC)
            .await
            .map_err(|e| GatewayError::RadioWrite {
                device_id: device_id.to_owned(),
                reason: format!("subscribe failed: {e}"),
            })?;

        let inbox = self.inbox.clone();
        let id = device_id.to_owned();
        self.spawn_task(notify_key(device_id), async move {
            let mut frames: u64 = 0;
            while let Some(bytes) = stream.next().await {
                match parse::decode(&bytes).map_err(GatewayError::from) {
                    Ok(frame) => {
                        frames += 1;
                        let note = RangingNotification { device_id: id.clone(), session, frame };
                        if inbox.send(Command::RangingNotification(note).into()).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{id}: dropping notification: {e}"),
                }
            }
            debug!("{id}: notification stream ended after {frames} frame(s)");
        });
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    /// Run `work` in the background under `key`.  A task already registered
    /// under the same key is cancelled first.
    pub fn spawn_task<F>(&mut self, key: impl Into<String>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = work => {}
            }
        });
        if let Some(old) = self.tasks.insert(key.clone(), TaskSlot { token, join }) {
            debug!("task {key}: replaced");
            old.token.cancel();
        }
    }

    /// Cancel the task registered under `key`.  Returns whether one existed.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some(slot) => {
                slot.token.cancel();
                debug!("task {key}: cancelled");
                true
            }
            None => false,
        }
    }

    /// `true` while a task registered under `key` is still running.
    pub fn is_task_running(&self, key: &str) -> bool {
        self.tasks.get(key).is_some_and(|slot| !slot.join.is_finished())
    }

    /// Disconnect every device and cancel every task.
    pub async fn cleanup_all(&mut self) {
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
        for (key, slot) in self.tasks.drain() {
            debug!("task {key}: cancelled on cleanup");
            slot.token.cancel();
        }
    }

    fn spawn_keepalive(&mut self, device_id: &str, peripheral: R::Peripheral) {
        let radio = Arc::clone(&self.radio);
        let inbox = self.inbox.clone();
        let interval = self.keepalive_interval;
        let id = device_id.to_owned();
        self.spawn_task(keepalive_key(device_id), async move {
            loop {
                tokio::time::sleep(interval).await;
                if !radio.is_connected(&peripheral).await {
                    warn!("{id}: link lost");
                    let request = DeviceRequest { device_id: id };
                    let _ = inbox.send(Command::DisconnectDevice(request).into());
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::messages::Message;
    use crate::radio::fake::FakeRadio;
    use crate::types::{RangingFrame, StandardFrame};

    fn registry(names: &[&str]) -> (Arc<FakeRadio>, DeviceRegistry<FakeRadio>, mpsc::UnboundedReceiver<Message>) {
        let radio = Arc::new(FakeRadio::advertising(names));
        let (tx, rx) = mpsc::unbounded_channel();
        let reg = DeviceRegistry::new(Arc::clone(&radio), tx, &GatewayConfig::default());
        (radio, reg, rx)
    }

    fn frame(measurement: u32) -> RangingFrame {
        RangingFrame::Standard(StandardFrame {
            msg_type: "dstwr".into(),
            state: "result".into(),
            responder_id: 100,
            sequence: measurement,
            measurement,
            distance: 1.5,
            time_round_1: 0.0,
            time_round_2: 0.0,
            time_reply_1: 0.0,
            time_reply_2: 0.0,
            nlos: 0,
            rssi: -80.0,
            fpi: -82.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn connect_matches_advertised_name_by_substring() {
        let (radio, mut reg, _rx) = registry(&["DW3000-T07", "DW3000-T08"]);
        let handle = reg.connect("T08").await.unwrap();
        assert_eq!(handle.name, "DW3000-T08");
        assert_eq!(handle.address, "fake:DW3000-T08");
        assert!(reg.is_connected("T08"));
        assert!(reg.is_task_running(&keepalive_key("T08")));
        assert!(radio.connected.lock().unwrap().contains("DW3000-T08"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_scan_miss_and_refusal_separately() {
        let (radio, mut reg, _rx) = registry(&["DW3000-T07"]);
        radio.refuse.lock().unwrap().insert("DW3000-T07".into());

        let miss = reg.connect("T99").await.unwrap_err();
        assert!(matches!(miss, GatewayError::DeviceNotFound(ref id) if id == "T99"));

        let refused = reg.connect("T07").await.unwrap_err();
        assert!(matches!(refused, GatewayError::DeviceConnect { ref device_id, .. } if device_id == "T07"));
        assert!(!reg.is_connected("T07"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_posts_disconnect_when_link_drops() {
        let (radio, mut reg, mut rx) = registry(&["T1"]);
        reg.connect("T1").await.unwrap();
        radio.drop_link("T1");

        let msg = rx.recv().await.unwrap();
        let expected = Command::DisconnectDevice(DeviceRequest { device_id: "T1".into() });
        assert_eq!(msg, Message::from(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_forwards_decoded_frames_and_skips_garbage() {
        let (radio, mut reg, mut rx) = registry(&["T1"]);
        reg.connect("T1").await.unwrap();
        reg.start_notify("T1", 1).await.unwrap();
        assert!(reg.is_task_running(&notify_key("T1")));

        radio.notify("T1", parse::encode(&frame(1)));
        radio.notify("T1", vec![0; 13]);
        radio.notify("T1", parse::encode(&frame(2)));

        for expected in [1, 2] {
            let Message::Command(Command::RangingNotification(note)) = rx.recv().await.unwrap() else {
                panic!("expected a ranging notification");
            };
            assert_eq!(note.device_id, "T1");
            assert_eq!(note.session, 1);
            assert_eq!(note.frame.measurement(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn control_writes_require_a_live_handle() {
        let (radio, mut reg, _rx) = registry(&["T1"]);
        let err = reg.send_control("T1", CONTROL, b"{}").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownDevice(_)));

        reg.connect("T1").await.unwrap();
        reg.send_control("T1", CONTROL, b"{}").await.unwrap();
        assert_eq!(radio.writes.lock().unwrap().len(), 1);

        radio.drop_link("T1");
        let err = reg.send_control("T1", CONTROL, b"{}").await.unwrap_err();
        assert!(matches!(err, GatewayError::RadioWrite { .. }));
    }

    const CONTROL: Uuid = crate::protocol::CONTROL_CHARACTERISTIC;

    #[tokio::test(start_paused = true)]
    async fn tasks_are_keyed_and_cancellable() {
        let (_radio, mut reg, _rx) = registry(&[]);
        assert!(!reg.cancel("notify:nobody"));

        reg.spawn_task("job", futures::future::pending());
        assert!(reg.is_task_running("job"));
        reg.spawn_task("job", futures::future::pending());
        assert!(reg.is_task_running("job"));

        assert!(reg.cancel("job"));
        assert!(!reg.is_task_running("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_and_cleanup_release_everything() {
        let (radio, mut reg, _rx) = registry(&["T1", "T2"]);
        reg.connect("T1").await.unwrap();
        reg.connect("T2").await.unwrap();
        reg.start_notify("T1", 1).await.unwrap();

        assert!(reg.disconnect("T1").await);
        assert!(!reg.disconnect("T1").await);
        assert!(!reg.is_task_running(&notify_key("T1")));
        assert!(!reg.is_task_running(&keepalive_key("T1")));

        reg.cleanup_all().await;
        assert_eq!(reg.device_ids().count(), 0);
        assert!(!reg.is_task_running(&keepalive_key("T2")));
        assert!(radio.connected.lock().unwrap().is_empty());
    }
}
