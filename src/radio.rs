//! The BLE radio seam: the narrow set of GATT primitives the gateway needs,
//! and its `btleplug` implementation.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info};
use uuid::Uuid;

/// Notification payloads from one subscribed characteristic.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A peripheral seen during a scan.
#[derive(Clone, Debug)]
pub struct ScanResult<P> {
    /// Advertised local name.
    pub name: String,
    /// Platform BLE identifier (MAC address on Linux, UUID on macOS / Windows).
    pub address: String,
    pub peripheral: P,
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    type Peripheral: Clone + Send + Sync + 'static;

    /// Scan for `timeout` and return every named peripheral seen.
    async fn scan(&self, timeout: Duration) -> Result<Vec<ScanResult<Self::Peripheral>>>;

    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<()>;

    async fn is_connected(&self, peripheral: &Self::Peripheral) -> bool;

    async fn write_characteristic(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()>;

    async fn subscribe_notify(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    async fn disconnect(&self, peripheral: &Self::Peripheral) -> Result<()>;
}

// ── btleplug ──────────────────────────────────────────────────────────────────

/// [`Radio`] over the first local Bluetooth adapter.
pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // CoreBluetooth ignores scans until the manager reports poweredOn.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => {
                        log::warn!("macOS: adapter not PoweredOn after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        Ok(Self { adapter })
    }

    fn find_char(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
    }
}

#[async_trait]
impl Radio for BtleRadio {
    type Peripheral = Peripheral;

    async fn scan(&self, timeout: Duration) -> Result<Vec<ScanResult<Peripheral>>> {
        info!("scan: scanning for {} s …", timeout.as_secs());
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        self.adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    let address = p.id().to_string();
                    debug!("scan: saw {name}  id={address}");
                    found.push(ScanResult { name, address, peripheral: p });
                }
            }
        }
        info!("scan: {} named device(s) found", found.len());
        Ok(found)
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<()> {
        // BlueZ's Device1.Connect can block forever on an out-of-range device.
        tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after 10 s"))??;

        // BlueZ reports the link before the GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        for c in peripheral.characteristics() {
            debug!("connect: {} exposes {}", peripheral.id(), c.uuid);
        }
        Ok(())
    }

    async fn is_connected(&self, peripheral: &Peripheral) -> bool {
        peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write_characteristic(
        &self,
        peripheral: &Peripheral,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()> {
        let c = Self::find_char(peripheral, characteristic)?;
        peripheral.write(&c, bytes, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn subscribe_notify(
        &self,
        peripheral: &Peripheral,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let c = Self::find_char(peripheral, characteristic)?;
        peripheral.subscribe(&c).await?;
        let stream = peripheral
            .notifications()
            .await?
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) });
        Ok(stream.boxed())
    }

    async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        peripheral.disconnect().await?;
        Ok(())
    }
}

// ── In-memory radio for unit tests ────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use futures::channel::mpsc;

    use super::*;

    /// Peripherals are their advertised names.
    #[derive(Default)]
    pub struct FakeRadio {
        pub advertised: Mutex<Vec<String>>,
        pub refuse: Mutex<HashSet<String>>,
        pub connected: Mutex<HashSet<String>>,
        pub writes: Mutex<Vec<(String, Uuid, Vec<u8>)>>,
        pub notifiers: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    }

    impl FakeRadio {
        pub fn advertising(names: &[&str]) -> Self {
            let radio = Self::default();
            radio.advertised.lock().unwrap().extend(names.iter().map(|n| n.to_string()));
            radio
        }

        /// Push a raw notification payload as if `name` sent it.
        pub fn notify(&self, name: &str, bytes: Vec<u8>) {
            let notifiers = self.notifiers.lock().unwrap();
            notifiers[name].unbounded_send(bytes).unwrap();
        }

        pub fn drop_link(&self, name: &str) {
            self.connected.lock().unwrap().remove(name);
        }

        pub fn writes_to(&self, name: &str, characteristic: Uuid) -> Vec<serde_json::Value> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, c, _)| n == name && *c == characteristic)
                .map(|(_, _, b)| serde_json::from_slice(b).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        type Peripheral = String;

        async fn scan(&self, _timeout: Duration) -> Result<Vec<ScanResult<String>>> {
            Ok(self
                .advertised
                .lock()
                .unwrap()
                .iter()
                .map(|name| ScanResult {
                    name: name.clone(),
                    address: format!("fake:{name}"),
                    peripheral: name.clone(),
                })
                .collect())
        }

        async fn connect(&self, peripheral: &String) -> Result<()> {
            if self.refuse.lock().unwrap().contains(peripheral) {
                return Err(anyhow!("connection refused"));
            }
            self.connected.lock().unwrap().insert(peripheral.clone());
            Ok(())
        }

        async fn is_connected(&self, peripheral: &String) -> bool {
            self.connected.lock().unwrap().contains(peripheral)
        }

        async fn write_characteristic(&self, peripheral: &String, characteristic: Uuid, bytes: &[u8]) -> Result<()> {
            if !self.connected.lock().unwrap().contains(peripheral) {
                return Err(anyhow!("not connected"));
            }
            self.writes
                .lock()
                .unwrap()
                .push((peripheral.clone(), characteristic, bytes.to_vec()));
            Ok(())
        }

        async fn subscribe_notify(&self, peripheral: &String, _characteristic: Uuid) -> Result<NotificationStream> {
            let (tx, rx) = mpsc::unbounded();
            self.notifiers.lock().unwrap().insert(peripheral.clone(), tx);
            Ok(rx.boxed())
        }

        async fn disconnect(&self, peripheral: &String) -> Result<()> {
            self.connected.lock().unwrap().remove(peripheral);
            Ok(())
        }
    }
}
